//! 在合成的三受试者数据集上端到端地构建并加载模型.

use std::path::{Path, PathBuf};

use gm_atlas::consts::files;
use gm_atlas::data::image::masked_median;
use gm_atlas::prelude::*;
use ndarray::Array3;

/// `(名称, 切片数, 椎体水平, 种子)`.
const SUBJECTS: [(&str, usize, u32, usize); 3] = [("sub-a", 5, 5, 1), ("sub-b", 3, 5, 4), ("sub-c", 4, 7, 9)];

fn write_subject(root: &Path, name: &str, z: usize, level: u32, seed: usize) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let cord = |h: usize, w: usize| (3..9).contains(&h) && (3..9).contains(&w);
    let gm = |h: usize, w: usize| (5..7).contains(&h) && (5..7).contains(&w);

    let im = Array3::from_shape_fn((z, 12, 12), |(k, h, w)| {
        let texture = ((h * 7 + w * 3 + k * 5 + seed * 11) % 13) as f32 * 0.3;
        let tissue = if gm(h, w) {
            40.0
        } else if cord(h, w) {
            20.0
        } else {
            0.0
        };
        10.0 + tissue + texture + seed as f32
    });
    let seg = Array3::from_shape_fn((z, 12, 12), |(_, h, w)| u8::from(cord(h, w)));
    let gm_seg = Array3::from_shape_fn((z, 12, 12), |(_, h, w)| u8::from(gm(h, w)));
    ScanVolume::from_raw(im, [1.0, 0.5, 0.5]).save(dir.join("t2s_im.nii.gz")).unwrap();
    LabelVolume::from_raw(seg, [1.0, 0.5, 0.5]).save(dir.join("t2s_seg.nii.gz")).unwrap();
    LabelVolume::from_raw(gm_seg, [1.0, 0.5, 0.5]).save(dir.join("t2s_gm.nii.gz")).unwrap();

    let text: String = (0..z).map(|k| format!("{k} {level}\n")).collect();
    std::fs::write(dir.join("level.txt"), text).unwrap();
}

fn config(root: &Path, method: Method, normalization: bool) -> AtlasConfig {
    let mut cfg = AtlasConfig::default();
    cfg.model.path_data = root.join("data");
    cfg.model.todo = Todo::Compute;
    cfg.model.new_model_dir = root.join(format!("gmseg_{method}"));
    cfg.model.method = method;
    cfg.model.n_neighbors_iso = 6;
    cfg.data.denoising = false;
    cfg.data.axial_res = 0.5;
    cfg.data.square_size_size_mm = 4.0;
    cfg.data.normalization = normalization;
    cfg.run.verbose = 0;
    cfg.run.workers = 2;
    cfg.run.tmp_dir = Some(root.join("tmp"));
    cfg
}

fn dataset() -> (tempfile::TempDir, PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    for (name, z, level, seed) in SUBJECTS {
        write_subject(&data, name, z, level, seed);
    }
    (root, data)
}

fn check_consistent(model: &Model) {
    let reference = model.mean_image().dim();
    assert_eq!(reference, (8, 8));
    assert_eq!(model.slices().len(), 12);
    for (i, s) in model.slices().iter().enumerate() {
        assert_eq!(s.id(), i);
        let r = s.registered().unwrap();
        assert_eq!(r.shape(), reference);
        for m in r.wm_seg.iter().chain(r.gm_seg.iter()) {
            assert_eq!(m.dim(), reference);
            assert!(m.iter().all(|&p| p == BACKGROUND || p == TISSUE));
        }
    }
    assert_eq!(model.reduced().n_rows(), model.slices().len());
}

#[test]
fn test_compute_then_load_pca() {
    let (root, _) = dataset();
    let cfg = config(root.path(), Method::Pca, true);
    let model = run(&cfg).unwrap();
    check_consistent(&model);
    assert_eq!(model.intensities().len(), 2);

    let dir = &cfg.model.new_model_dir;
    for name in [files::SLICES, files::INTENSITIES, files::FITTED_MODEL, files::FITTED_DATA, files::INFO] {
        assert!(dir.join(name).is_file(), "{name}");
    }

    let first = Model::load(dir).unwrap();
    let second = Model::load(dir).unwrap();
    check_consistent(&first);
    assert_eq!(first.slices(), model.slices());
    assert_eq!(first.intensities(), model.intensities());
    assert_eq!(first.reduced().coords().dim(), model.reduced().coords().dim());
    assert_eq!(first.mean_image(), second.mean_image());
    assert_eq!(first.summary(), model.summary());

    let id = first.nearest_slices(&first.slices()[7].registered_im().unwrap().view(), 1).unwrap();
    assert_eq!(id, vec![7]);
}

#[test]
fn test_compute_isomap_half() {
    let (root, _) = dataset();
    let cfg = config(root.path(), Method::Isomap, true);
    let model = Model::compute(&cfg).unwrap();
    check_consistent(&model);
    assert_eq!(model.reduced().method(), Method::Isomap);
    assert_eq!(model.reduced().n_components(), 6);

    let loaded = Model::load(&cfg.model.new_model_dir).unwrap();
    assert_eq!(loaded.reduced().coords().dim(), (12, 6));
    assert_eq!(loaded.config().model.method, Method::Isomap);
}

#[test]
fn test_levels_aggregate_their_own_slices() {
    let (root, _) = dataset();
    let cfg = config(root.path(), Method::Pca, false);
    let model = Model::compute(&cfg).unwrap();

    let level5: Vec<_> = model.slices().iter().filter(|s| s.level_bucket() == 5).collect();
    let level7: Vec<_> = model.slices().iter().filter(|s| s.level_bucket() == 7).collect();
    assert_eq!(level5.len(), 8);
    assert_eq!(level7.len(), 4);

    let expected_gm = |slices: &[&Slice]| {
        let medians: Vec<f64> = slices
            .iter()
            .map(|s| {
                let r = s.registered().unwrap();
                masked_median(&r.im.view(), &r.gm_seg[0].view()).unwrap()
            })
            .collect();
        medians.iter().sum::<f64>() / medians.len() as f64
    };
    let table = model.intensities();
    assert!((table.get(5).unwrap().gm - expected_gm(&level5)).abs() < 1e-9);
    assert!((table.get(7).unwrap().gm - expected_gm(&level7)).abs() < 1e-9);
    assert_eq!(*table, IntensityTable::compute(model.slices()).unwrap());
}

#[test]
fn test_rebuild_moves_previous_model_aside() {
    let (root, _) = dataset();
    let cfg = config(root.path(), Method::Pca, true);
    Model::compute(&cfg).unwrap();
    Model::compute(&cfg).unwrap();

    let old = gm_atlas::model::old_dir_of(&cfg.model.new_model_dir);
    assert!(Model::load(&old).is_ok());
    assert!(Model::load(&cfg.model.new_model_dir).is_ok());
}

#[test]
fn test_load_without_intensity_table() {
    let (root, _) = dataset();
    let cfg = config(root.path(), Method::Pca, true);
    Model::compute(&cfg).unwrap();

    std::fs::remove_file(cfg.model.new_model_dir.join(files::INTENSITIES)).unwrap();
    let err = Model::load(&cfg.model.new_model_dir).unwrap_err();
    assert!(err.is_integrity(), "{err}");
}
