//! Isomap 流形嵌入.
//!
//! 1. 在欧氏距离下构造对称的 k-近邻图.
//! 2. 对每个顶点跑 Dijkstra, 得到测地距离矩阵 `G`.
//! 3. 对 `K = -G^2 / 2` 做双中心化后特征分解, 取前 m 个特征对作为嵌入.
//!
//! 新样本经由其 k 个最近训练样本接入图中, 再以同样的中心化方式投影.

use binary_heap_plus::BinaryHeap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::flip_sign;
use crate::error::{AtlasError, Result};

/// 拟合好的 Isomap 模型.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsomapModel {
    n_neighbors: usize,
    /// 训练样本, 每行一个.
    train: Array2<f64>,
    /// 训练样本之间的测地距离.
    geodesic: Array2<f64>,
    /// 单位特征向量, 形状为 `(n, m)`.
    alphas: Array2<f64>,
    lambdas: Array1<f64>,
    /// 训练核矩阵的列均值.
    k_fit_rows: Array1<f64>,
    /// 训练核矩阵的总均值.
    k_fit_all: f64,
}

/// 两个样本的欧氏距离.
#[inline]
fn euclidean(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

/// 与 `sample` 最近的 `k` 个训练样本 (下标, 距离), 按距离升序. 跳过 `skip`.
fn nearest(train: &ArrayView2<f64>, sample: &ArrayView1<f64>, k: usize, skip: Option<usize>) -> Vec<(usize, f64)> {
    let mut dist: Vec<(usize, f64)> = train
        .outer_iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != skip)
        .map(|(i, row)| (i, euclidean(&row, sample)))
        .collect();
    dist.sort_by_key(|&(i, d)| (OrderedFloat(d), i));
    dist.truncate(k);
    dist
}

/// 对称 k-近邻图的邻接表.
fn knn_graph(x: &ArrayView2<f64>, k: usize) -> Vec<Vec<(usize, f64)>> {
    let n = x.nrows();
    let mut adj = vec![Vec::new(); n];
    for (i, row) in x.outer_iter().enumerate() {
        for (j, d) in nearest(x, &row, k, Some(i)) {
            adj[i].push((j, d));
            adj[j].push((i, d));
        }
    }
    adj
}

/// 单源最短路.
fn dijkstra(adj: &[Vec<(usize, f64)>], source: usize) -> Vec<f64> {
    let mut dist = vec![f64::INFINITY; adj.len()];
    dist[source] = 0.0;
    let mut heap: BinaryHeap<(f64, usize), _> = BinaryHeap::new_by(|a: &(f64, usize), b: &(f64, usize)| b.0.total_cmp(&a.0));
    heap.push((0.0, source));
    while let Some((d, u)) = heap.pop() {
        if d > dist[u] {
            continue;
        }
        for &(v, w) in adj[u].iter() {
            let nd = d + w;
            if nd < dist[v] {
                dist[v] = nd;
                heap.push((nd, v));
            }
        }
    }
    dist
}

impl IsomapModel {
    /// 在 `x` (每行一个样本) 上拟合 `n_components` 维嵌入.
    ///
    /// 近邻图不连通时返回 [`AtlasError::Numerical`].
    pub fn fit(x: &ArrayView2<f64>, n_neighbors: usize, n_components: usize) -> Result<(Self, Array2<f64>)> {
        let n = x.nrows();
        if n < 2 {
            return Err(AtlasError::Numerical(format!("Isomap 至少需要 2 个样本, 但只有 {n} 个")));
        }
        if n_neighbors == 0 || n_neighbors >= n {
            return Err(AtlasError::Numerical(format!(
                "Isomap 近邻数必须位于 [1, {}), 但发现了 {n_neighbors}",
                n
            )));
        }
        if n_components == 0 || n_components > n {
            return Err(AtlasError::Numerical(format!(
                "Isomap 嵌入维数必须位于 [1, {n}], 但发现了 {n_components}"
            )));
        }

        let adj = knn_graph(x, n_neighbors);
        let mut geodesic = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            let dist = dijkstra(&adj, i);
            if dist.iter().any(|d| !d.is_finite()) {
                return Err(AtlasError::Numerical(format!(
                    "{n_neighbors}-近邻图不连通, 请增大 n_neighbors_iso"
                )));
            }
            geodesic.row_mut(i).assign(&Array1::from(dist));
        }
        // 数值上保持对称.
        let geodesic = (&geodesic + &geodesic.t()) / 2.0;

        let kernel = geodesic.mapv(|g| -0.5 * g * g);
        let k_fit_rows = kernel
            .mean_axis(Axis(0))
            .ok_or_else(|| AtlasError::Numerical("空核矩阵".into()))?;
        let k_fit_all = k_fit_rows.mean().unwrap_or(0.0);
        let centered = Array2::from_shape_fn((n, n), |(i, j)| {
            kernel[(i, j)] - k_fit_rows[i] - k_fit_rows[j] + k_fit_all
        });

        let (vals, vecs) = centered
            .eigh(UPLO::Lower)
            .map_err(|e| AtlasError::Numerical(format!("核矩阵特征分解失败: {e}")))?;
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(vals[i])));

        let mut alphas = Array2::<f64>::zeros((n, n_components));
        let mut lambdas = Array1::<f64>::zeros(n_components);
        for (c, &i) in order.iter().take(n_components).enumerate() {
            let mut v = vecs.column(i).to_owned();
            flip_sign(&mut v);
            alphas.column_mut(c).assign(&v);
            lambdas[c] = vals[i].max(0.0);
        }
        let coords = &alphas * &lambdas.mapv(f64::sqrt);

        Ok((
            Self {
                n_neighbors,
                train: x.to_owned(),
                geodesic,
                alphas,
                lambdas,
                k_fit_rows,
                k_fit_all,
            },
            coords,
        ))
    }

    /// 嵌入维数.
    #[inline]
    pub fn n_components(&self) -> usize {
        self.alphas.ncols()
    }

    /// 近邻数.
    #[inline]
    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    /// 输入维数.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.train.ncols()
    }

    /// 训练样本之间的测地距离.
    #[inline]
    pub fn geodesic(&self) -> ArrayView2<'_, f64> {
        self.geodesic.view()
    }

    /// 将一个新样本投影到嵌入空间.
    pub fn transform(&self, x: &ArrayView1<f64>) -> Result<Array1<f64>> {
        if x.len() != self.n_features() {
            return Err(AtlasError::Numerical(format!(
                "样本维数 {} 与模型维数 {} 不一致",
                x.len(),
                self.n_features()
            )));
        }
        let n = self.train.nrows();
        let neighbors = nearest(&self.train.view(), x, self.n_neighbors, None);
        let geo = Array1::from_shape_fn(n, |j| {
            neighbors
                .iter()
                .map(|&(i, d)| d + self.geodesic[(i, j)])
                .fold(f64::INFINITY, f64::min)
        });

        let k_new = geo.mapv(|g| -0.5 * g * g);
        let k_pred_cols = k_new.mean().unwrap_or(0.0);
        let centered = &k_new - &self.k_fit_rows - k_pred_cols + self.k_fit_all;
        let proj = centered.dot(&self.alphas);
        Ok(Array1::from_shape_fn(self.n_components(), |c| {
            let l = self.lambdas[c];
            if l > 1e-12 {
                proj[c] / l.sqrt()
            } else {
                0.0
            }
        }))
    }

    /// 检查各部分维数是否一致.
    pub(crate) fn is_consistent(&self) -> bool {
        let n = self.train.nrows();
        self.geodesic.dim() == (n, n)
            && self.alphas.nrows() == n
            && self.lambdas.len() == self.alphas.ncols()
            && self.k_fit_rows.len() == n
    }
}
