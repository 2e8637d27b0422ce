//! 分组配准.
//!
//! 参考图像是所有切片平均白质掩码的逐像素均值. 每个切片的平均白质掩码配准到参考图像上,
//! 得到的前向形变场再以最近邻插值作用于该切片的全部白质/灰质掩码, 以默认插值作用于强度图像.
//!
//! 参考图像在并行工作开始前就已确定; 每个切片只读写自己的工作目录 `wf_slice{id}`.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use ndarray::ArrayView2;

use crate::data::image::{image_to_labels, mask_to_image, mean_stack};
use crate::data::{Interp, Registered, Slice};
use crate::error::{AtlasError, Result};
use crate::registration::{Registrar, RegistrationRecipe};
use crate::{Image2d, Mask2d};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 分组配准参数.
#[derive(Copy, Clone, Debug)]
pub struct CoregisterParam<'a> {
    /// 多步配准参数.
    pub recipe: &'a RegistrationRecipe,

    /// 各切片工作目录的父目录.
    pub tmp_root: &'a Path,

    /// 完成后是否删除切片工作目录.
    pub rm_tmp: bool,

    /// 工作池大小. 0 表示使用全部可用核心.
    pub workers: usize,
}

/// 计算参考白质图像: 每个切片平均白质掩码的逐像素均值.
pub fn reference_wm(slices: &[Slice]) -> Result<Image2d> {
    let means = slices.iter().map(Slice::mean_wm).collect::<Result<Vec<_>>>()?;
    mean_stack(means.iter().map(|m| m.view()))
}

/// 切片 `id` 的工作目录.
#[inline]
pub fn work_dir_of(tmp_root: &Path, id: usize) -> PathBuf {
    tmp_root.join(format!("wf_slice{id}"))
}

fn warp_masks(
    masks: &[Mask2d],
    reference: &ArrayView2<f64>,
    registrar: &dyn Registrar,
    warp: &Path,
    work_dir: &Path,
) -> Result<Vec<Mask2d>> {
    masks
        .iter()
        .map(|m| {
            let warped = registrar.apply(&mask_to_image(m).view(), reference, warp, Interp::Nearest, work_dir)?;
            Ok(image_to_labels(&warped))
        })
        .collect()
}

/// 将单个切片配准到参考图像上.
pub fn register_slice(
    slice: &Slice,
    reference: &ArrayView2<f64>,
    registrar: &dyn Registrar,
    recipe: &RegistrationRecipe,
    work_dir: &Path,
) -> Result<Registered> {
    let src = slice.mean_wm()?;
    let pair = registrar.register(&src.view(), reference, recipe, work_dir)?;
    let warp = pair.src2dest.as_path();

    let wm_seg = warp_masks(slice.wm_seg(), reference, registrar, warp, work_dir)?;
    let gm_seg = warp_masks(slice.gm_seg(), reference, registrar, warp, work_dir)?;
    let im = registrar.apply(&slice.im().view(), reference, warp, Interp::Linear, work_dir)?;
    Ok(Registered {
        im,
        wm_seg,
        gm_seg,
        normalized: false,
    })
}

/// 在独占的工作目录中配准切片, 并按需清理目录. 清理失败只给出警告.
fn register_in_dir(
    slice: &Slice,
    reference: &ArrayView2<f64>,
    registrar: &dyn Registrar,
    param: &CoregisterParam,
) -> Result<Registered> {
    let id = slice.id();
    let dir = work_dir_of(param.tmp_root, id);
    let result = fs::create_dir_all(&dir)
        .map_err(|e| AtlasError::io(&dir, e))
        .and_then(|_| register_slice(slice, reference, registrar, param.recipe, &dir));

    if param.rm_tmp {
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!("Failed to remove {}: {e}", dir.display());
        }
    }
    debug!("Slice {id} registered: {}", result.is_ok());
    result.map_err(|e| AtlasError::SliceRegistration {
        id,
        source: Box::new(e),
    })
}

/// 分组配准整个字典, 结果写回各切片. 返回参考白质图像.
///
/// 任意一个切片配准失败都会中止整个过程, 此时不会有切片被写入配准结果.
pub fn coregister(slices: &mut [Slice], registrar: &dyn Registrar, param: &CoregisterParam) -> Result<Image2d> {
    let reference = reference_wm(slices)?;
    fs::create_dir_all(param.tmp_root).map_err(|e| AtlasError::io(param.tmp_root, e))?;
    info!(
        "Registering {} slices onto the mean white matter ({:?})",
        slices.len(),
        reference.dim()
    );

    let view = reference.view();
    let registered: Vec<Registered> = {
        cfg_if::cfg_if! {
            if #[cfg(feature = "rayon")] {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(param.workers)
                    .build()
                    .map_err(|e| AtlasError::Registration(format!("无法创建配准工作池: {e}")))?;
                pool.install(|| {
                    slices
                        .par_iter()
                        .map(|s| register_in_dir(s, &view, registrar, param))
                        .collect::<Result<Vec<_>>>()
                })?
            } else {
                slices
                    .iter()
                    .map(|s| register_in_dir(s, &view, registrar, param))
                    .collect::<Result<Vec<_>>>()?
            }
        }
    };

    for (s, r) in slices.iter_mut().zip(registered) {
        s.set_registered(r);
    }
    Ok(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::DEFAULT_REGISTER_PARAM;
    use crate::registration::{InProcessRegistrar, WarpPair};
    use ndarray::Array2;

    fn square(top: usize, left: usize) -> Mask2d {
        Array2::from_shape_fn((16, 16), |(y, x)| {
            u8::from((top..top + 6).contains(&y) && (left..left + 6).contains(&x))
        })
    }

    fn slice(id: usize, top: usize, left: usize) -> Slice {
        let wm = square(top, left);
        let gm = square(top + 2, left + 2);
        let im = Array2::from_shape_fn((16, 16), |(y, x)| (y * 16 + x) as f64);
        Slice::new(id, "sub", id, 3.0, im, vec![wm], vec![gm])
    }

    fn param<'a>(recipe: &'a RegistrationRecipe, root: &'a Path) -> CoregisterParam<'a> {
        CoregisterParam {
            recipe,
            tmp_root: root,
            rm_tmp: true,
            workers: 2,
        }
    }

    #[test]
    fn test_reference_is_mean_of_means() {
        let slices = vec![slice(0, 2, 2), slice(1, 2, 2)];
        let reference = reference_wm(&slices).unwrap();
        assert_eq!(reference, mask_to_image(&square(2, 2)));
    }

    #[test]
    fn test_aligned_dictionary_is_unchanged() {
        let root = tempfile::tempdir().unwrap();
        let recipe: RegistrationRecipe = DEFAULT_REGISTER_PARAM.parse().unwrap();
        let mut slices = vec![slice(0, 5, 5), slice(1, 5, 5), slice(2, 5, 5)];

        let reference = coregister(&mut slices, &InProcessRegistrar, &param(&recipe, root.path())).unwrap();
        for s in &slices {
            let r = s.registered().unwrap();
            assert_eq!(r.shape(), reference.dim());
            assert_eq!(r.wm_seg, s.wm_seg());
            assert_eq!(r.gm_seg, s.gm_seg());
            assert!(r.im.iter().zip(s.im().iter()).all(|(a, b)| (a - b).abs() < 1e-9));
            assert!(!work_dir_of(root.path(), s.id()).exists());
        }
    }

    #[test]
    fn test_masks_keep_labels_and_shape() {
        let root = tempfile::tempdir().unwrap();
        let recipe: RegistrationRecipe = DEFAULT_REGISTER_PARAM.parse().unwrap();
        let mut slices = vec![slice(0, 3, 4), slice(1, 6, 5), slice(2, 5, 8)];

        let reference = coregister(&mut slices, &InProcessRegistrar, &param(&recipe, root.path())).unwrap();
        for s in &slices {
            let r = s.registered().unwrap();
            assert_eq!(r.shape(), reference.dim());
            for m in r.wm_seg.iter().chain(r.gm_seg.iter()) {
                assert_eq!(m.dim(), reference.dim());
                assert!(m.iter().all(|&p| p == 0 || p == 1));
            }
        }
    }

    /// 对第 `fail_id` 个切片报错的配准实现.
    struct FailOn(usize);

    impl Registrar for FailOn {
        fn register(
            &self,
            src: &ArrayView2<f64>,
            dest: &ArrayView2<f64>,
            recipe: &RegistrationRecipe,
            work_dir: &Path,
        ) -> Result<WarpPair> {
            if work_dir.ends_with(format!("wf_slice{}", self.0)) {
                return Err(AtlasError::Registration("exit status 1".into()));
            }
            InProcessRegistrar.register(src, dest, recipe, work_dir)
        }

        fn apply(
            &self,
            src: &ArrayView2<f64>,
            dest: &ArrayView2<f64>,
            warp: &Path,
            interp: Interp,
            work_dir: &Path,
        ) -> Result<Image2d> {
            InProcessRegistrar.apply(src, dest, warp, interp, work_dir)
        }
    }

    #[test]
    fn test_one_failure_aborts_all() {
        let root = tempfile::tempdir().unwrap();
        let recipe: RegistrationRecipe = DEFAULT_REGISTER_PARAM.parse().unwrap();
        let mut slices = vec![slice(0, 5, 5), slice(1, 5, 5), slice(2, 5, 5)];

        let err = coregister(&mut slices, &FailOn(1), &param(&recipe, root.path())).unwrap_err();
        assert!(matches!(err, AtlasError::SliceRegistration { id: 1, .. }));
        assert!(slices.iter().all(|s| s.registered().is_none()));
    }

    /// 在应用最后一个形变 (强度图像) 后, 把工作目录替换成同名的普通文件, 使目录无法被删除.
    struct LeaveFileBehind;

    impl Registrar for LeaveFileBehind {
        fn register(
            &self,
            src: &ArrayView2<f64>,
            dest: &ArrayView2<f64>,
            recipe: &RegistrationRecipe,
            work_dir: &Path,
        ) -> Result<WarpPair> {
            InProcessRegistrar.register(src, dest, recipe, work_dir)
        }

        fn apply(
            &self,
            src: &ArrayView2<f64>,
            dest: &ArrayView2<f64>,
            warp: &Path,
            interp: Interp,
            work_dir: &Path,
        ) -> Result<Image2d> {
            let out = InProcessRegistrar.apply(src, dest, warp, interp, work_dir)?;
            if matches!(interp, Interp::Linear) {
                fs::remove_dir_all(work_dir).unwrap();
                fs::write(work_dir, b"busy").unwrap();
            }
            Ok(out)
        }
    }

    #[test]
    fn test_cleanup_failure_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let recipe: RegistrationRecipe = DEFAULT_REGISTER_PARAM.parse().unwrap();
        let mut slices = vec![slice(0, 5, 5), slice(1, 4, 6), slice(2, 5, 5)];

        let reference = coregister(&mut slices, &LeaveFileBehind, &param(&recipe, root.path())).unwrap();
        for s in &slices {
            assert_eq!(s.registered().unwrap().shape(), reference.dim());
            // 目录没有被删除, 只给出了警告.
            assert!(work_dir_of(root.path(), s.id()).is_file());
        }
    }

    #[test]
    fn test_keep_tmp_dirs() {
        let root = tempfile::tempdir().unwrap();
        let recipe: RegistrationRecipe = DEFAULT_REGISTER_PARAM.parse().unwrap();
        let mut slices = vec![slice(0, 5, 5), slice(1, 5, 5)];
        let mut p = param(&recipe, root.path());
        p.rm_tmp = false;

        coregister(&mut slices, &InProcessRegistrar, &p).unwrap();
        assert!(work_dir_of(root.path(), 1).join("warp_src2dest.npy").is_file());
    }
}
