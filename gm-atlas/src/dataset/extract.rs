//! 切片提取.
//!
//! 对每个受试者, 在每个含有脊髓的切片位置上: 可选去噪, 重采样到给定分辨率,
//! 再以脊髓质心为中心裁剪为固定大小的正方形. 白质掩码由脊髓分割减去灰质分割得到.

use std::path::Path;

use log::{debug, info, warn};
use ndarray::ArrayView2;

use super::subject::{subject_loader, SubjectFiles};
use crate::config::DataParam;
use crate::consts::label::{is_tissue, BACKGROUND};
use crate::data::image::{
    binarize, crop_square, image_to_labels, mask_to_image, median_filter3, resample, Interp,
};
use crate::data::{LabelVolume, LevelSource, NiftiHeaderAttr, Plane, ScanVolume, Slice};
use crate::error::{AtlasError, Result};
use crate::{Image2d, Mask2d};

/// 切片提取参数.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExtractParam {
    /// 切分平面.
    pub plane: Plane,

    /// 是否做 3x3 中值去噪.
    pub denoising: bool,

    /// 目标分辨率, 单位 mm.
    pub res_mm: f64,

    /// 裁剪边长, 单位像素.
    pub square_px: usize,
}

impl From<&DataParam> for ExtractParam {
    fn from(d: &DataParam) -> Self {
        Self {
            plane: Plane::Axial,
            denoising: d.denoising,
            res_mm: d.axial_res,
            square_px: d.square_px(),
        }
    }
}

/// 重采样标签掩码. 使用最近邻插值, 不会产生新的标签值.
fn resample_mask(mask: &ArrayView2<u8>, pixel_mm: (f64, f64), res_mm: f64) -> Mask2d {
    let im = mask_to_image(&mask.to_owned());
    image_to_labels(&resample(&im.view(), pixel_mm, res_mm, Interp::Nearest))
}

/// `cord` 中属于脊髓但不属于 `gm` 的部分.
fn subtract(cord: &Mask2d, gm: &Mask2d) -> Mask2d {
    let mut wm = cord.clone();
    ndarray::Zip::from(&mut wm).and(gm).for_each(|w, &g| {
        if is_tissue(g) {
            *w = BACKGROUND;
        }
    });
    wm
}

/// 从一个受试者的文件中提取切片. 切片 id 从 0 开始局部编号.
pub fn extract_subject(files: &SubjectFiles, param: &ExtractParam) -> Result<Vec<Slice>> {
    let im = ScanVolume::open(&files.im)?;
    let seg = LabelVolume::open(&files.seg)?;
    let gms = files
        .gm
        .iter()
        .map(LabelVolume::open)
        .collect::<Result<Vec<_>>>()?;
    let level = match &files.level {
        Some(p) => LevelSource::open(p)?,
        None => {
            debug!("Subject {} has no level file, level set to 0", files.name);
            LevelSource::None
        }
    };

    for (what, shape) in std::iter::once(("seg", seg.shape()))
        .chain(gms.iter().map(|g| ("gm", g.shape())))
    {
        if shape != im.shape() {
            return Err(AtlasError::InputData {
                subject: files.name.clone(),
                reason: format!("{what} 形状 {shape:?} 与强度图像形状 {:?} 不一致", im.shape()),
            });
        }
    }

    let plane = param.plane;
    let pixel_mm = plane.pixel_mm(im.pix_dim());
    let mut slices = Vec::new();
    for index in 0..plane.extent(im.shape()) {
        let cord_raw = binarize(&seg.slice_in(plane, index).to_owned());
        if !cord_raw.iter().copied().any(is_tissue) {
            continue;
        }

        let mut data: Image2d = im.slice_in(plane, index).mapv(f64::from);
        if param.denoising {
            data = median_filter3(&data.view());
        }
        let data = resample(&data.view(), pixel_mm, param.res_mm, Interp::Linear);
        let cord = resample_mask(&cord_raw.view(), pixel_mm, param.res_mm);
        let center = match plane.crop_center(&cord.view()) {
            Some(c) => c,
            None => {
                debug!("Subject {} slice {index}: cord vanished after resampling", files.name);
                continue;
            }
        };

        let size = param.square_px;
        let cord = crop_square(&cord.view(), center, size);
        let gm_seg: Vec<Mask2d> = gms
            .iter()
            .map(|g| {
                let g = binarize(&g.slice_in(plane, index).to_owned());
                crop_square(&resample_mask(&g.view(), pixel_mm, param.res_mm).view(), center, size)
            })
            .collect();
        let wm_seg = if gm_seg.is_empty() {
            vec![cord]
        } else {
            gm_seg.iter().map(|g| subtract(&cord, g)).collect()
        };

        let lvl = match plane {
            Plane::Axial => level.level_at(index, Some(&cord_raw.view())),
            _ => 0.0,
        };
        slices.push(Slice::new(
            slices.len(),
            files.name.clone(),
            index,
            lvl,
            crop_square(&data.view(), center, size),
            wm_seg,
            gm_seg,
        ));
    }
    Ok(slices)
}

/// 从数据根目录提取整个切片字典.
///
/// 无法使用的受试者会被跳过并给出警告. 切片 id 在整个字典中连续且唯一.
/// 如果最终没有任何切片, 返回 [`AtlasError::EmptyDictionary`].
pub fn extract_dictionary<P: AsRef<Path>>(root: P, param: &ExtractParam) -> Result<Vec<Slice>> {
    let root = root.as_ref();
    let mut dictionary: Vec<Slice> = Vec::new();
    for (dir, files) in subject_loader(root)? {
        let subject = files.and_then(|f| extract_subject(&f, param).map(|s| (f.name, s)));
        match subject {
            Ok((name, mut slices)) => {
                let offset = dictionary.len();
                slices.iter_mut().for_each(|s| s.offset_id(offset));
                info!("Subject {name}: {} slices extracted", slices.len());
                dictionary.extend(slices);
            }
            Err(e) => warn!("Skip subject {}: {e}", dir.display()),
        }
    }
    if dictionary.is_empty() {
        return Err(AtlasError::EmptyDictionary(format!(
            "{} 中没有可用的受试者",
            root.display()
        )));
    }
    Ok(dictionary)
}
