//! 稠密位移场.

use std::path::Path;

use ndarray::{s, Array3, ArrayView2, Axis};
use ndarray_npy::{read_npy, write_npy};

use crate::data::Interp;
use crate::error::{AtlasError, Result};
use crate::{Idx2d, Image2d};

/// 定义在目标图像像素网格上的位移场, 形状为 `(2, H, W)`.
///
/// 第 0 层为高方向位移, 第 1 层为宽方向位移. 输出像素 `p` 取源图像在 `p + d(p)` 处的值.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplacementField {
    data: Array3<f64>,
}

impl DisplacementField {
    /// 处处相同的位移场.
    pub fn constant((h, w): Idx2d, (dy, dx): (f64, f64)) -> Self {
        let mut data = Array3::zeros((2, h, w));
        data.index_axis_mut(Axis(0), 0).fill(dy);
        data.index_axis_mut(Axis(0), 1).fill(dx);
        Self { data }
    }

    /// 场所在的像素网格形状.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        let (_, h, w) = self.data.dim();
        (h, w)
    }

    /// 高方向位移.
    #[inline]
    pub fn dy(&self) -> ArrayView2<'_, f64> {
        self.data.slice(s![0, .., ..])
    }

    /// 宽方向位移.
    #[inline]
    pub fn dx(&self) -> ArrayView2<'_, f64> {
        self.data.slice(s![1, .., ..])
    }

    /// 最大位移长度.
    pub fn max_norm(&self) -> f64 {
        self.dy()
            .iter()
            .zip(self.dx().iter())
            .map(|(y, x)| y.hypot(*x))
            .fold(0.0, f64::max)
    }

    /// 逐点取反. 对平移场恰为逆变换.
    #[inline]
    pub fn negated(&self) -> Self {
        Self {
            data: self.data.mapv(|v| -v),
        }
    }

    /// 将位移场应用到 `src` 上. 输出形状与场一致.
    pub fn apply(&self, src: &ArrayView2<f64>, interp: Interp) -> Image2d {
        let (dy, dx) = (self.dy(), self.dx());
        Image2d::from_shape_fn(self.shape(), |(y, x)| {
            interp.sample(src, y as f64 + dy[(y, x)], x as f64 + dx[(y, x)])
        })
    }

    /// 以 `.npy` 格式保存.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_npy(path, &self.data)
            .map_err(|e| AtlasError::Registration(format!("无法写出形变场 {}: {e}", path.display())))
    }

    /// 读取 `.npy` 格式的位移场.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data: Array3<f64> = read_npy(path)
            .map_err(|e| AtlasError::Registration(format!("无法读取形变场 {}: {e}", path.display())))?;
        if data.dim().0 != 2 {
            return Err(AtlasError::Registration(format!(
                "形变场 {} 的形状 {:?} 非法",
                path.display(),
                data.dim()
            )));
        }
        Ok(Self { data })
    }
}
