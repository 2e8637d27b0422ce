//! 二维图像的基础数值操作.
//!
//! 所有操作都按 (高, 宽) 组织图像, 坐标以像素中心为整数点.

use ndarray::{Array2, ArrayView2, Zip};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::consts::label::{is_background, is_tissue, BACKGROUND, TISSUE};
use crate::error::{AtlasError, Result};
use crate::{Image2d, Mask2d};

/// 插值方式.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Interp {
    /// 最近邻. 用于标签掩码, 不会引入新的标签值.
    Nearest,

    /// 双线性. 用于强度图像.
    #[default]
    Linear,
}

impl Interp {
    /// 外部配准程序使用的插值名.
    #[inline]
    pub fn as_arg(&self) -> &'static str {
        match self {
            Interp::Nearest => "nn",
            Interp::Linear => "linear",
        }
    }

    /// 在 `im` 的连续坐标 `(y, x)` 处采样. 越界坐标被钳制到图像边缘.
    ///
    /// `im` 必须非空.
    #[inline]
    pub fn sample(&self, im: &ArrayView2<f64>, y: f64, x: f64) -> f64 {
        match self {
            Interp::Nearest => sample_nearest(im, y, x),
            Interp::Linear => sample_bilinear(im, y, x),
        }
    }
}

#[inline]
fn clamp_index(v: f64, len: usize) -> usize {
    if v <= 0.0 || !v.is_finite() {
        0
    } else {
        (v as usize).min(len - 1)
    }
}

fn sample_nearest(im: &ArrayView2<f64>, y: f64, x: f64) -> f64 {
    let (h, w) = im.dim();
    im[(clamp_index(y.round(), h), clamp_index(x.round(), w))]
}

fn sample_bilinear(im: &ArrayView2<f64>, y: f64, x: f64) -> f64 {
    let (h, w) = im.dim();
    let y = y.clamp(0.0, (h - 1) as f64);
    let x = x.clamp(0.0, (w - 1) as f64);
    let (y0, x0) = (y.floor() as usize, x.floor() as usize);
    let (y1, x1) = ((y0 + 1).min(h - 1), (x0 + 1).min(w - 1));
    let (fy, fx) = (y - y0 as f64, x - x0 as f64);

    let top = im[(y0, x0)] * (1.0 - fx) + im[(y0, x1)] * fx;
    let bottom = im[(y1, x0)] * (1.0 - fx) + im[(y1, x1)] * fx;
    top * (1.0 - fy) + bottom * fy
}

/// 逐像素求均值图像.
///
/// 如果 `images` 为空, 或者其中图像形状不一致, 则返回 `Err`.
pub fn mean_stack<'a, I>(images: I) -> Result<Image2d>
where
    I: IntoIterator<Item = ArrayView2<'a, f64>>,
{
    let mut it = images.into_iter();
    let first = it
        .next()
        .ok_or_else(|| AtlasError::EmptyDictionary("无法对空图像集合求均值".into()))?;
    let mut acc = first.to_owned();
    let mut count = 1usize;
    for im in it {
        if im.dim() != acc.dim() {
            return Err(AtlasError::ShapeMismatch {
                expected: acc.dim(),
                got: im.dim(),
                context: "mean_stack".into(),
            });
        }
        acc += &im;
        count += 1;
    }
    acc /= count as f64;
    Ok(acc)
}

/// 掩码转换为浮点图像.
#[inline]
pub fn mask_to_image(mask: &Mask2d) -> Image2d {
    mask.mapv(f64::from)
}

/// 将 (最近邻插值后的) 浮点图像转换回标签掩码.
#[inline]
pub fn image_to_labels(im: &Image2d) -> Mask2d {
    im.mapv(|v| v.round().clamp(0.0, u8::MAX as f64) as u8)
}

/// 将任意非零像素置为 [`TISSUE`], 其余置为 [`BACKGROUND`].
#[inline]
pub fn binarize(mask: &Mask2d) -> Mask2d {
    mask.mapv(|p| if is_background(p) { BACKGROUND } else { TISSUE })
}

/// 收集 `mask == TISSUE` 位置的图像值.
pub fn masked_values(im: &ArrayView2<f64>, mask: &ArrayView2<u8>) -> Vec<f64> {
    Zip::from(im)
        .and(mask)
        .fold(Vec::new(), |mut acc, &v, &m| {
            if is_tissue(m) {
                acc.push(v);
            }
            acc
        })
}

/// 求中位数. 偶数个元素时取中间两个元素的均值. `values` 为空时返回 `None`.
///
/// `values` 会被重新排列.
pub fn median(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    values.sort_unstable_by_key(|v| OrderedFloat(*v));
    if n % 2 == 1 {
        Some(values[n / 2])
    } else {
        Some((values[n / 2 - 1] + values[n / 2]) / 2.0)
    }
}

/// 掩码范围内的强度中位数. 掩码为空时返回 `None`.
#[inline]
pub fn masked_median(im: &ArrayView2<f64>, mask: &ArrayView2<u8>) -> Option<f64> {
    median(&mut masked_values(im, mask))
}

/// 图像最小值与最大值. 图像为空时返回 `None`.
pub fn min_max(im: &ArrayView2<f64>) -> Option<(f64, f64)> {
    im.iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// 以像素值为权重求质心 (高, 宽). 总权重不为正时返回 `None`.
pub fn center_of_mass(im: &ArrayView2<f64>) -> Option<(f64, f64)> {
    let (mut total, mut sy, mut sx) = (0.0, 0.0, 0.0);
    for ((y, x), &v) in im.indexed_iter() {
        total += v;
        sy += v * y as f64;
        sx += v * x as f64;
    }
    (total > 0.0).then(|| (sy / total, sx / total))
}

/// 3x3 中值滤波, 边缘像素使用可用的邻居.
pub fn median_filter3(im: &ArrayView2<f64>) -> Image2d {
    let (h, w) = im.dim();
    let mut buf = Vec::with_capacity(9);
    Array2::from_shape_fn((h, w), |(y, x)| {
        buf.clear();
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                buf.push(im[(ny, nx)]);
            }
        }
        // 3x3 邻域至少包含自身.
        median(&mut buf).unwrap_or(im[(y, x)])
    })
}

/// 半径为 `radius` 的均值滤波. `radius == 0` 时返回原图拷贝.
pub fn box_blur(im: &ArrayView2<f64>, radius: usize) -> Image2d {
    if radius == 0 {
        return im.to_owned();
    }
    let (h, w) = im.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        let (y0, y1) = (y.saturating_sub(radius), (y + radius).min(h - 1));
        let (x0, x1) = (x.saturating_sub(radius), (x + radius).min(w - 1));
        let mut sum = 0.0;
        for ny in y0..=y1 {
            for nx in x0..=x1 {
                sum += im[(ny, nx)];
            }
        }
        sum / ((y1 - y0 + 1) * (x1 - x0 + 1)) as f64
    })
}

/// 将像素尺寸为 `(h_mm, w_mm)` 的图像重采样为各向同性分辨率 `new_res` (mm).
///
/// 输出形状为 `round(h * h_mm / new_res) x round(w * w_mm / new_res)`, 至少为 1x1.
/// 采样位置按像素中心对齐.
pub fn resample(im: &ArrayView2<f64>, (h_mm, w_mm): (f64, f64), new_res: f64, interp: Interp) -> Image2d {
    let (h, w) = im.dim();
    let out_h = ((h as f64 * h_mm / new_res).round() as usize).max(1);
    let out_w = ((w as f64 * w_mm / new_res).round() as usize).max(1);
    let (sy, sx) = (new_res / h_mm, new_res / w_mm);
    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let src_y = (y as f64 + 0.5) * sy - 0.5;
        let src_x = (x as f64 + 0.5) * sx - 0.5;
        interp.sample(im, src_y, src_x)
    })
}

/// 以 `center` (高, 宽) 为中心裁剪出 `size x size` 的正方形. 图像外的部分以 `T::default()` 填充.
pub fn crop_square<T: Copy + Default>(im: &ArrayView2<T>, center: (f64, f64), size: usize) -> Array2<T> {
    let (h, w) = im.dim();
    let half = size as f64 / 2.0;
    let top = (center.0 - half + 0.5).round() as i64;
    let left = (center.1 - half + 0.5).round() as i64;
    Array2::from_shape_fn((size, size), |(y, x)| {
        let sy = top + y as i64;
        let sx = left + x as i64;
        if sy < 0 || sx < 0 || sy >= h as i64 || sx >= w as i64 {
            T::default()
        } else {
            im[(sy as usize, sx as usize)]
        }
    })
}
