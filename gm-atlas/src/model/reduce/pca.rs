//! 主成分分析.
//!
//! 样本数通常远小于像素数, 因此对 `X X^T / (n - 1)` 做特征分解 (Gram 技巧),
//! 再由 `X^T u / |X^T u|` 还原主轴.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::flip_sign;
use crate::error::{AtlasError, Result};

/// 累计方差比例比较时的容差.
const RATIO_EPS: f64 = 1e-12;

/// 拟合好的 PCA 模型.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaModel {
    mean: Array1<f64>,
    /// 形状为 `(k, n_features)`, 每行是一个单位主轴.
    components: Array2<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
}

impl PcaModel {
    /// 在 `x` (每行一个样本) 上拟合, 保留累计方差比例达到 `fraction` 的最少主成分.
    ///
    /// 返回模型以及 `x` 的降维坐标.
    pub fn fit(x: &ArrayView2<f64>, fraction: f64) -> Result<(Self, Array2<f64>)> {
        let (n, p) = x.dim();
        if n < 2 || p == 0 {
            return Err(AtlasError::Numerical(format!(
                "PCA 至少需要 2 个非空样本, 但输入形状为 {:?}",
                x.dim()
            )));
        }
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| AtlasError::Numerical("无法计算样本均值".into()))?;
        let xc = x - &mean;

        let gram = xc.dot(&xc.t()) / (n - 1) as f64;
        let (vals, vecs) = gram
            .eigh(UPLO::Lower)
            .map_err(|e| AtlasError::Numerical(format!("Gram 矩阵特征分解失败: {e}")))?;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(vals[i])));
        let variances: Vec<f64> = order.iter().map(|&i| vals[i].max(0.0)).collect();
        let total: f64 = variances.iter().sum();
        if !(total > 1e-12) {
            return Err(AtlasError::Numerical("样本方差为零, 无法做 PCA".into()));
        }

        let mut cum = 0.0;
        let mut k = variances.len();
        for (i, v) in variances.iter().enumerate() {
            cum += v / total;
            if cum + RATIO_EPS >= fraction {
                k = i + 1;
                break;
            }
        }
        // 方差为零的方向没有意义.
        k = k.min(variances.iter().filter(|&&v| v > 1e-12 * total).count()).max(1);

        let mut components = Array2::<f64>::zeros((k, p));
        for (row, &i) in order.iter().take(k).enumerate() {
            let mut axis = xc.t().dot(&vecs.column(i));
            let norm = axis.dot(&axis).sqrt();
            if norm > 0.0 {
                axis /= norm;
            }
            flip_sign(&mut axis);
            components.row_mut(row).assign(&axis);
        }

        let explained_variance = Array1::from(variances[..k].to_vec());
        let explained_variance_ratio = &explained_variance / total;
        let coords = xc.dot(&components.t());
        Ok((
            Self {
                mean,
                components,
                explained_variance,
                explained_variance_ratio,
            },
            coords,
        ))
    }

    /// 保留的主成分个数.
    #[inline]
    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// 输入维数.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    /// 主轴, 形状为 `(k, n_features)`.
    #[inline]
    pub fn components(&self) -> ArrayView2<'_, f64> {
        self.components.view()
    }

    /// 每个主成分解释的方差.
    #[inline]
    pub fn explained_variance(&self) -> ArrayView1<'_, f64> {
        self.explained_variance.view()
    }

    /// 每个主成分解释的方差比例.
    #[inline]
    pub fn explained_variance_ratio(&self) -> ArrayView1<'_, f64> {
        self.explained_variance_ratio.view()
    }

    /// 将一个样本投影到主成分空间.
    pub fn transform(&self, x: &ArrayView1<f64>) -> Result<Array1<f64>> {
        if x.len() != self.n_features() {
            return Err(AtlasError::Numerical(format!(
                "样本维数 {} 与模型维数 {} 不一致",
                x.len(),
                self.n_features()
            )));
        }
        Ok(self.components.dot(&(x - &self.mean)))
    }

    /// 检查各部分维数是否一致.
    pub(crate) fn is_consistent(&self) -> bool {
        let k = self.components.nrows();
        self.components.ncols() == self.mean.len()
            && self.explained_variance.len() == k
            && self.explained_variance_ratio.len() == k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 50 个样本, 每个 64 维, 由三个方差递减的方向叠加而成.
    fn fifty_slices() -> Array2<f64> {
        Array2::from_shape_fn((50, 64), |(i, j)| {
            let t = i as f64;
            let a = (t * 0.37).sin() * 5.0;
            let b = (t * 1.13).cos() * 2.0;
            let c = (t * 2.71).sin() * 0.7;
            a * ((j as f64) * 0.1).cos() + b * ((j % 8) as f64 - 3.5) / 4.0 + c * ((j / 8) as f64 - 3.5) / 4.0
                + 10.0
        })
    }

    #[test]
    fn test_minimal_components_for_fraction() {
        let x = fifty_slices();
        let (model, coords) = PcaModel::fit(&x.view(), 0.8).unwrap();
        let k = model.n_components();
        assert_eq!(coords.dim(), (50, k));
        assert!(model.is_consistent());

        let ratio = model.explained_variance_ratio();
        let cum: f64 = ratio.sum();
        assert!(cum + RATIO_EPS >= 0.8);
        // 少保留一个主成分就达不到目标比例.
        let cum_less: f64 = ratio.iter().take(k - 1).sum();
        assert!(cum_less < 0.8);
        // 方差按降序排列.
        assert!(ratio.iter().zip(ratio.iter().skip(1)).all(|(a, b)| a >= b));
        let var = model.explained_variance();
        assert_eq!(var.len(), k);
        assert!(var.iter().zip(var.iter().skip(1)).all(|(a, b)| a >= b));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let x = fifty_slices();
        let (m1, c1) = PcaModel::fit(&x.view(), 0.8).unwrap();
        let (m2, c2) = PcaModel::fit(&x.view(), 0.8).unwrap();
        assert_eq!(m1.n_components(), m2.n_components());
        assert!(c1.iter().zip(c2.iter()).all(|(a, b)| (a - b).abs() < 1e-9));
    }

    #[test]
    fn test_transform_matches_fit() {
        let x = fifty_slices();
        let (model, coords) = PcaModel::fit(&x.view(), 0.95).unwrap();
        for i in [0, 17, 49] {
            let y = model.transform(&x.row(i)).unwrap();
            assert!(y.iter().zip(coords.row(i).iter()).all(|(a, b)| (a - b).abs() < 1e-8));
        }
        assert!(model.transform(&Array1::zeros(3).view()).is_err());
    }

    #[test]
    fn test_rank_one_keeps_one() {
        let x = Array2::from_shape_fn((10, 6), |(i, j)| (i as f64) * (j as f64 + 1.0));
        let (model, _) = PcaModel::fit(&x.view(), 0.99).unwrap();
        assert_eq!(model.n_components(), 1);
        assert!((model.explained_variance_ratio()[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(PcaModel::fit(&Array2::<f64>::zeros((1, 4)).view(), 0.8).is_err());
        assert!(PcaModel::fit(&Array2::<f64>::ones((5, 4)).view(), 0.8).is_err());
    }
}
