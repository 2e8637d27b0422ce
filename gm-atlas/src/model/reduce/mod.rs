//! 降维.

use log::info;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::{Method, ModelParam};
use crate::error::{AtlasError, Result};
use crate::Image2d;

pub mod isomap;
pub mod pca;

pub use isomap::IsomapModel;
pub use pca::PcaModel;

/// 令向量中绝对值最大的分量为正. 特征向量的符号因此与数值库无关.
pub(crate) fn flip_sign(v: &mut Array1<f64>) {
    let pivot = v
        .iter()
        .copied()
        .fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        v.mapv_inplace(|x| -x);
    }
}

/// 将一组形状相同的图像按行展平为矩阵.
pub fn flatten_rows<'a, I>(images: I) -> Result<Array2<f64>>
where
    I: IntoIterator<Item = ArrayView2<'a, f64>>,
{
    let mut shape = None;
    let mut buf = Vec::new();
    let mut rows = 0usize;
    for im in images {
        match shape {
            None => shape = Some(im.dim()),
            Some(s) if s != im.dim() => {
                return Err(AtlasError::ShapeMismatch {
                    expected: s,
                    got: im.dim(),
                    context: "flatten".into(),
                })
            }
            _ => {}
        }
        buf.extend(im.iter().copied());
        rows += 1;
    }
    let (h, w) = shape.ok_or_else(|| AtlasError::EmptyDictionary("没有可展平的图像".into()))?;
    Array2::from_shape_vec((rows, h * w), buf).map_err(|e| AtlasError::Numerical(e.to_string()))
}

/// 拟合好的降维模型.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FittedReduction {
    /// 线性降维.
    Pca(PcaModel),

    /// 流形嵌入.
    Isomap(IsomapModel),
}

impl FittedReduction {
    /// 降维方法.
    #[inline]
    pub fn method(&self) -> Method {
        match self {
            FittedReduction::Pca(_) => Method::Pca,
            FittedReduction::Isomap(_) => Method::Isomap,
        }
    }

    /// 保留的维数.
    #[inline]
    pub fn n_components(&self) -> usize {
        match self {
            FittedReduction::Pca(m) => m.n_components(),
            FittedReduction::Isomap(m) => m.n_components(),
        }
    }

    /// 输入维数.
    #[inline]
    pub fn n_features(&self) -> usize {
        match self {
            FittedReduction::Pca(m) => m.n_features(),
            FittedReduction::Isomap(m) => m.n_features(),
        }
    }

    /// 投影一个展平后的样本.
    pub fn transform(&self, x: &ArrayView1<f64>) -> Result<Array1<f64>> {
        match self {
            FittedReduction::Pca(m) => m.transform(x),
            FittedReduction::Isomap(m) => m.transform(x),
        }
    }

    pub(crate) fn is_consistent(&self) -> bool {
        match self {
            FittedReduction::Pca(m) => m.is_consistent(),
            FittedReduction::Isomap(m) => m.is_consistent(),
        }
    }
}

/// 降维空间: 拟合好的变换, 以及字典中每个切片的坐标 (与字典同序).
#[derive(Clone, Debug, PartialEq)]
pub struct ReducedSpace {
    fitted: FittedReduction,
    coords: Array2<f64>,
}

impl ReducedSpace {
    /// 按 `param` 选择方法, 在展平矩阵 `data` 上拟合.
    pub fn fit(data: &ArrayView2<f64>, param: &ModelParam) -> Result<Self> {
        let (fitted, coords) = match param.method {
            Method::Pca => {
                let (m, c) = PcaModel::fit(data, param.k_pca)?;
                info!(
                    "PCA keeps {} components, variance {:.3} ({:.1}% of total)",
                    m.n_components(),
                    m.explained_variance().sum(),
                    m.explained_variance_ratio().sum() * 100.0
                );
                (FittedReduction::Pca(m), c)
            }
            Method::Isomap => {
                let n_components = param.n_compo_iso.resolve(data.nrows());
                let (m, c) = IsomapModel::fit(data, param.n_neighbors_iso, n_components)?;
                info!(
                    "Isomap embeds {} samples into {} dimensions ({} neighbours)",
                    data.nrows(),
                    m.n_components(),
                    m.n_neighbors()
                );
                (FittedReduction::Isomap(m), c)
            }
        };
        Ok(Self { fitted, coords })
    }

    /// 由已拟合的部分组装, 并检查两者是否一致.
    pub fn from_parts(fitted: FittedReduction, coords: Array2<f64>) -> Result<Self> {
        if !fitted.is_consistent() {
            return Err(AtlasError::integrity("fitted_model", "降维模型内部维数不一致"));
        }
        if coords.ncols() != fitted.n_components() {
            return Err(AtlasError::integrity(
                "fitted_data",
                format!(
                    "坐标列数 {} 与保留维数 {} 不一致",
                    coords.ncols(),
                    fitted.n_components()
                ),
            ));
        }
        Ok(Self { fitted, coords })
    }

    /// 拆分为拟合模型与坐标.
    #[inline]
    pub fn into_parts(self) -> (FittedReduction, Array2<f64>) {
        (self.fitted, self.coords)
    }

    /// 拟合模型.
    #[inline]
    pub fn fitted(&self) -> &FittedReduction {
        &self.fitted
    }

    /// 字典切片的坐标, 每行一个切片.
    #[inline]
    pub fn coords(&self) -> ArrayView2<'_, f64> {
        self.coords.view()
    }

    /// 降维方法.
    #[inline]
    pub fn method(&self) -> Method {
        self.fitted.method()
    }

    /// 保留的维数.
    #[inline]
    pub fn n_components(&self) -> usize {
        self.coords.ncols()
    }

    /// 行数, 即切片数.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.coords.nrows()
    }

    /// 投影一张 (已配准、已归一化的) 图像.
    pub fn transform(&self, im: &ArrayView2<f64>) -> Result<Array1<f64>> {
        let flat: Image2d = im.as_standard_layout().into_owned();
        let flat = flat
            .into_shape(im.len())
            .map_err(|e| AtlasError::Numerical(e.to_string()))?;
        self.fitted.transform(&flat.view())
    }
}
