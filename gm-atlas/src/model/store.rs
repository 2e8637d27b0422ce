//! 模型目录的读写.
//!
//! 目录布局:
//!
//! ```text
//! <dir>/
//!   manifest.toml          格式版本, 切片数, 保留维数, 降维方法, 构建参数
//!   slices.binz            切片字典
//!   intensities.binz       强度表
//!   fitted_model.binz      降维模型
//!   fitted_data.binz       降维坐标
//!   info.txt               人类可读的构建参数
//!   mean_image.png         平均图像预览
//! ```
//!
//! 每个 `.binz` 工件都是 zlib 压缩后的 bincode 数据, 可以独立加载.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, info, warn};
use ndarray::Array2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::intensity::IntensityTable;
use super::reduce::{FittedReduction, ReducedSpace};
use super::Model;
use crate::config::{AtlasConfig, Method};
use crate::consts::{files, MODEL_FORMAT_VERSION};
use crate::data::image::mean_stack;
use crate::data::{IntensityWindow, Slice};
use crate::error::{AtlasError, Result};

/// 模型清单.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// 目录格式版本.
    pub format_version: u32,

    /// 切片数.
    pub n_slices: usize,

    /// 保留的维数.
    pub n_components: usize,

    /// 降维方法.
    pub method: Method,

    /// 构建参数.
    pub config: AtlasConfig,
}

/// `dir` 加上后缀 `suffix` 得到的同级路径. 末尾的 `/` 会被忽略.
fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut s = dir.components().collect::<PathBuf>().into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// 旧模型目录的备份位置.
#[inline]
pub fn old_dir_of(dir: &Path) -> PathBuf {
    sibling(dir, "_old")
}

/// 第一个尚未被占用的编号备份位置 `{dir}_old1`, `{dir}_old2`, ...
fn numbered_old_dir_of(dir: &Path) -> PathBuf {
    (1..)
        .map(|n| sibling(dir, &format!("_old{n}")))
        .find(|p| !p.exists())
        .unwrap_or_else(|| old_dir_of(dir))
}

fn write_artifact<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let path = dir.join(name);
    let raw = bincode::serialize(value).map_err(|e| AtlasError::integrity(name, e.to_string()))?;
    let mut e = ZlibEncoder::new(Vec::with_capacity(raw.len() / 4 + 8), Compression::best());
    e.write_all(&raw).map_err(|err| AtlasError::io(&path, err))?;
    let buf = e.finish().map_err(|err| AtlasError::io(&path, err))?;
    fs::write(&path, buf).map_err(|err| AtlasError::io(&path, err))?;
    debug!("Wrote {} ({} bytes uncompressed)", path.display(), raw.len());
    Ok(())
}

fn read_artifact<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(AtlasError::integrity(name, format!("{} 不存在", path.display())));
    }
    let buf = fs::read(&path).map_err(|e| AtlasError::integrity(name, e.to_string()))?;
    let mut d = ZlibDecoder::new(buf.as_slice());
    let mut raw = Vec::with_capacity(buf.len() * 4);
    d.read_to_end(&mut raw)
        .map_err(|e| AtlasError::integrity(name, format!("解压失败: {e}")))?;
    bincode::deserialize(&raw).map_err(|e| AtlasError::integrity(name, format!("反序列化失败: {e}")))
}

fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let path = dir.join(files::MANIFEST);
    let text = toml::to_string(manifest).map_err(|e| AtlasError::Config(e.to_string()))?;
    fs::write(&path, text).map_err(|e| AtlasError::io(&path, e))
}

fn read_manifest(dir: &Path) -> Result<Manifest> {
    let path = dir.join(files::MANIFEST);
    let text = fs::read_to_string(&path)
        .map_err(|e| AtlasError::integrity(files::MANIFEST, format!("{}: {e}", path.display())))?;
    let manifest: Manifest =
        toml::from_str(&text).map_err(|e| AtlasError::integrity(files::MANIFEST, e.to_string()))?;
    if manifest.format_version != MODEL_FORMAT_VERSION {
        return Err(AtlasError::integrity(
            files::MANIFEST,
            format!(
                "不支持的格式版本 {}, 期望 {MODEL_FORMAT_VERSION}",
                manifest.format_version
            ),
        ));
    }
    Ok(manifest)
}

/// 将全部工件写入 `dir`.
fn write_all(dir: &Path, model: &Model) -> Result<()> {
    let manifest = Manifest {
        format_version: MODEL_FORMAT_VERSION,
        n_slices: model.slices.len(),
        n_components: model.reduced.n_components(),
        method: model.reduced.method(),
        config: model.config.clone(),
    };
    write_artifact(dir, files::SLICES, &model.slices)?;
    write_artifact(dir, files::INTENSITIES, &model.intensities)?;
    write_artifact(dir, files::FITTED_MODEL, model.reduced.fitted())?;
    write_artifact(dir, files::FITTED_DATA, &model.reduced.coords().to_owned())?;
    write_manifest(dir, &manifest)?;

    let info = dir.join(files::INFO);
    fs::write(&info, model.config.to_string()).map_err(|e| AtlasError::io(&info, e))?;

    let mean_image = model.mean_image.view();
    match IntensityWindow::covering(&mean_image) {
        Some(window) => window.save_gray(&mean_image, dir.join(files::MEAN_PREVIEW))?,
        None => warn!("Mean image has no finite pixel, preview skipped"),
    }
    Ok(())
}

/// 保存模型到 `dir`.
///
/// 先写入同级的临时目录, 全部成功后再改名为 `dir`. 已存在的 `dir` 会被改名为 `dir_old`
/// (更早的 `dir_old` 改名为第一个空闲的 `dir_oldN`). 写入失败时临时目录被删除, 原有的 `dir` 保持不变.
pub(crate) fn save(dir: &Path, model: &Model) -> Result<()> {
    let dir = dir.components().collect::<PathBuf>();
    let staging = sibling(&dir, &format!(".tmp-{}", std::process::id()));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| AtlasError::io(&staging, e))?;
    }
    fs::create_dir_all(&staging).map_err(|e| AtlasError::io(&staging, e))?;

    if let Err(e) = write_all(&staging, model) {
        if let Err(err) = fs::remove_dir_all(&staging) {
            warn!("Failed to remove {}: {err}", staging.display());
        }
        return Err(e);
    }

    if dir.exists() {
        let old = old_dir_of(&dir);
        if old.exists() {
            let kept = numbered_old_dir_of(&dir);
            fs::rename(&old, &kept).map_err(|e| AtlasError::io(&old, e))?;
            warn!("Earlier backup {} moved to {}", old.display(), kept.display());
        }
        fs::rename(&dir, &old).map_err(|e| AtlasError::io(&dir, e))?;
        info!("Previous model moved to {}", old.display());
    }
    fs::rename(&staging, &dir).map_err(|e| AtlasError::io(&staging, e))?;
    info!("Model saved to {}", dir.display());
    Ok(())
}

/// 检查切片字典自身的一致性: id 即下标, 配准结果存在且形状一致.
fn check_slices(slices: &[Slice]) -> Result<(usize, usize)> {
    let mut shape = None;
    for (i, s) in slices.iter().enumerate() {
        if s.id() != i {
            return Err(AtlasError::integrity(
                files::SLICES,
                format!("第 {i} 个切片的 id 为 {}", s.id()),
            ));
        }
        let reg = s
            .registered()
            .ok_or_else(|| AtlasError::integrity(files::SLICES, format!("切片 {i} 没有配准数据")))?;
        match shape {
            None => shape = Some(reg.shape()),
            Some(sh) if sh != reg.shape() => {
                return Err(AtlasError::integrity(
                    files::SLICES,
                    format!("切片 {i} 的配准形状 {:?} 与 {sh:?} 不一致", reg.shape()),
                ))
            }
            _ => {}
        }
    }
    shape.ok_or_else(|| AtlasError::integrity(files::SLICES, "切片字典为空"))
}

/// 从 `dir` 读取全部工件, 并检查它们之间的一致性. 平均图像由切片的原始图像重新计算.
pub(crate) fn load(dir: &Path) -> Result<Model> {
    let manifest = read_manifest(dir)?;
    let slices: Vec<Slice> = read_artifact(dir, files::SLICES)?;
    let intensities: IntensityTable = read_artifact(dir, files::INTENSITIES)?;
    let fitted: FittedReduction = read_artifact(dir, files::FITTED_MODEL)?;
    let coords: Array2<f64> = read_artifact(dir, files::FITTED_DATA)?;

    let (h, w) = check_slices(&slices)?;
    if let Some(level) = intensities.invalid_level() {
        return Err(AtlasError::integrity(
            files::INTENSITIES,
            format!("水平 {level} 的强度统计非法: {:?}", intensities.get(level)),
        ));
    }
    if slices.len() != manifest.n_slices {
        return Err(AtlasError::integrity(
            files::SLICES,
            format!("清单记录 {} 个切片, 实际 {} 个", manifest.n_slices, slices.len()),
        ));
    }
    if coords.nrows() != slices.len() {
        return Err(AtlasError::integrity(
            files::FITTED_DATA,
            format!("坐标有 {} 行, 但有 {} 个切片", coords.nrows(), slices.len()),
        ));
    }
    if fitted.method() != manifest.method || fitted.n_components() != manifest.n_components {
        return Err(AtlasError::integrity(
            files::FITTED_MODEL,
            format!(
                "降维模型 ({}, {} 维) 与清单 ({}, {} 维) 不一致",
                fitted.method(),
                fitted.n_components(),
                manifest.method,
                manifest.n_components
            ),
        ));
    }
    if fitted.n_features() != h * w {
        return Err(AtlasError::integrity(
            files::FITTED_MODEL,
            format!("输入维数 {} 与切片像素数 {} 不一致", fitted.n_features(), h * w),
        ));
    }
    let reduced = ReducedSpace::from_parts(fitted, coords)?;
    let mean_image = mean_stack(slices.iter().map(|s| s.im().view()))
        .map_err(|e| AtlasError::integrity(files::SLICES, e.to_string()))?;

    info!(
        "Loaded {} slices, {} levels from {}",
        slices.len(),
        intensities.len(),
        dir.display()
    );
    Ok(Model {
        config: manifest.config,
        slices,
        mean_image,
        intensities,
        reduced,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelParam;
    use crate::data::Registered;
    use crate::model::intensity::LevelIntensity;
    use crate::model::reduce::flatten_rows;
    use ndarray::Array2;

    fn sample_model() -> Model {
        let mut slices = Vec::new();
        for i in 0..6 {
            let im = Array2::from_shape_fn((4, 4), |(y, x)| ((i * 3 + y * 4 + x) % 7) as f64 + i as f64);
            let wm = Array2::from_shape_fn((4, 4), |(y, _)| u8::from(y < 2));
            let gm = Array2::from_shape_fn((4, 4), |(y, _)| u8::from(y >= 2));
            let mut s = Slice::new(i, "sub", i, 5.0, im.clone(), vec![wm.clone()], vec![gm.clone()]);
            s.set_registered(Registered {
                im,
                wm_seg: vec![wm],
                gm_seg: vec![gm],
                normalized: false,
            });
            slices.push(s);
        }
        let intensities = IntensityTable::compute(&slices).unwrap();
        let data = flatten_rows(slices.iter().filter_map(|s| s.registered_im()).map(|m| m.view())).unwrap();
        let reduced = ReducedSpace::fit(&data.view(), &ModelParam::default()).unwrap();
        let mean_image = mean_stack(slices.iter().map(|s| s.im().view())).unwrap();
        Model {
            config: AtlasConfig::default(),
            slices,
            mean_image,
            intensities,
            reduced,
        }
    }

    #[test]
    fn test_sibling_ignores_trailing_slash() {
        assert_eq!(old_dir_of(Path::new("a/gmseg/")), PathBuf::from("a/gmseg_old"));
        assert_eq!(old_dir_of(Path::new("gmseg")), PathBuf::from("gmseg_old"));
    }

    #[test]
    fn test_save_load() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("model");
        let s = sample_model();
        save(&dir, &s).unwrap();
        for name in [files::SLICES, files::INTENSITIES, files::FITTED_MODEL, files::FITTED_DATA, files::INFO] {
            assert!(dir.join(name).is_file(), "{name}");
        }

        let back = load(&dir).unwrap();
        assert_eq!(back.slices, s.slices);
        assert_eq!(back.intensities, s.intensities);
        assert_eq!(back.reduced, s.reduced);
        assert_eq!(back.config, s.config);
        assert_eq!(back.mean_image, s.mean_image);
        assert!(dir.join(files::MEAN_PREVIEW).is_file());
    }

    #[test]
    fn test_existing_dir_is_moved_aside() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("model");
        let s = sample_model();
        save(&dir, &s).unwrap();
        fs::write(dir.join("marker"), "first").unwrap();
        save(&dir, &s).unwrap();

        let old = old_dir_of(&dir);
        assert!(old.join("marker").is_file());
        assert!(!dir.join("marker").exists());

        // 再次重建时, 上一个备份改为编号备份而不是被删除.
        save(&dir, &s).unwrap();
        save(&dir, &s).unwrap();
        let first = root.path().join("model_old1");
        assert_eq!(fs::read_to_string(first.join("marker")).unwrap(), "first");
        assert!(root.path().join("model_old2").join(files::SLICES).is_file());
        assert!(!old.join("marker").exists());
        assert!(!root.path().join("model_old3").exists());
        for d in [&dir, &old, &first] {
            assert!(load(d).is_ok());
        }
    }

    #[test]
    fn test_missing_or_corrupt_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("model");
        let s = sample_model();
        save(&dir, &s).unwrap();

        fs::write(dir.join(files::FITTED_DATA), b"not zlib").unwrap();
        assert!(load(&dir).err().unwrap().is_integrity());

        fs::remove_file(dir.join(files::INTENSITIES)).unwrap();
        assert!(load(&dir).err().unwrap().is_integrity());

        fs::remove_file(dir.join(files::MANIFEST)).unwrap();
        assert!(load(&dir).err().unwrap().is_integrity());
    }

    #[test]
    fn test_invalid_intensity_table() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("model");
        let s = sample_model();
        save(&dir, &s).unwrap();

        let bad = LevelIntensity {
            gm: 1.0,
            wm: 2.0,
            min: 9.0,
            max: f64::NAN,
        };
        let table: IntensityTable = [(5, bad)].into_iter().collect();
        write_artifact(&dir, files::INTENSITIES, &table).unwrap();
        let err = load(&dir).err().unwrap();
        assert!(matches!(err, AtlasError::DataIntegrity { ref artifact, .. } if artifact == files::INTENSITIES));
    }

    #[test]
    fn test_row_count_mismatch() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("model");
        let s = sample_model();
        save(&dir, &s).unwrap();

        let coords = s.reduced.coords().slice(ndarray::s![..5, ..]).to_owned();
        write_artifact(&dir, files::FITTED_DATA, &coords).unwrap();
        let err = load(&dir).err().unwrap();
        assert!(matches!(err, AtlasError::DataIntegrity { ref artifact, .. } if artifact == files::FITTED_DATA));
    }
}
