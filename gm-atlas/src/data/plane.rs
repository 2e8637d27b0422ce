//! 解剖平面. 描述如何从 `(z, H, W)` 体数据中取出二维切片.

use ndarray::{ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use super::image::center_of_mass;
use crate::consts::label::TISSUE;
use crate::Idx3d;

/// 解剖平面.
///
/// 体数据统一按 `(z, H, W)` 访问, 因此水平面沿第 0 维切分,
/// 冠状面沿第 1 维切分, 矢状面沿第 2 维切分.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Plane {
    /// 水平面 (轴向). 模型只使用该平面.
    #[default]
    Axial,

    /// 冠状面.
    Coronal,

    /// 矢状面.
    Sagittal,
}

impl Plane {
    /// 切分所沿的维度.
    #[inline]
    pub fn axis(&self) -> Axis {
        match self {
            Plane::Axial => Axis(0),
            Plane::Coronal => Axis(1),
            Plane::Sagittal => Axis(2),
        }
    }

    /// 形状为 `shape` 的体数据在该平面上的切片个数.
    #[inline]
    pub fn extent(&self, (z, h, w): Idx3d) -> usize {
        match self {
            Plane::Axial => z,
            Plane::Coronal => h,
            Plane::Sagittal => w,
        }
    }

    /// 获取第 `index` 个切片视图.
    ///
    /// 当 `index` 越界时 panic.
    #[inline]
    pub fn slice_at<'a, T>(&self, data: ArrayView3<'a, T>, index: usize) -> ArrayView2<'a, T> {
        data.index_axis_move(self.axis(), index)
    }

    /// 切片的像素尺寸 (行, 列), 单位 mm. `pix_dim` 按 `[z, H, W]` 给出.
    #[inline]
    pub fn pixel_mm(&self, [z, h, w]: [f64; 3]) -> (f64, f64) {
        match self {
            Plane::Axial => (h, w),
            Plane::Coronal => (z, w),
            Plane::Sagittal => (z, h),
        }
    }

    /// 以脊髓掩码的质心作为裁剪中心. 掩码为空时返回 `None`.
    pub fn crop_center(&self, cord: &ArrayView2<u8>) -> Option<(f64, f64)> {
        let weights = cord.mapv(|p| if p == TISSUE { 1.0 } else { 0.0 });
        center_of_mass(&weights.view())
    }
}
