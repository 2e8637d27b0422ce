//! 进程内平移配准.
//!
//! 先以质心对齐给出初值, 再对每个执行步骤做均方误差下的局部网格搜索.
//! 步骤的 `smooth` 作为均值滤波半径, `iter` 作为每个搜索步长上的最大轮数.
//! 只估计平移, 因此 `algo` 与 `metric` 不影响结果.

use std::path::Path;

use log::debug;
use ndarray::ArrayView2;

use super::field::DisplacementField;
use super::recipe::RegistrationRecipe;
use super::{Registrar, WarpPair};
use crate::consts::files::{WARP_DEST2SRC, WARP_SRC2DEST};
use crate::data::image::{box_blur, center_of_mass};
use crate::data::Interp;
use crate::error::{AtlasError, Result};
use crate::Image2d;

/// 局部搜索的步长序列, 单位像素.
const SEARCH_STEPS: [f64; 4] = [1.0, 0.5, 0.25, 0.125];

/// 纯 Rust 的平移配准实现. 形变场以 `.npy` 保存.
#[derive(Copy, Clone, Debug, Default)]
pub struct InProcessRegistrar;

/// 平移 `(dy, dx)` 下 `src` 与 `dest` 的均方误差.
fn mean_squares(src: &ArrayView2<f64>, dest: &ArrayView2<f64>, (dy, dx): (f64, f64)) -> f64 {
    let mut sum = 0.0;
    for ((y, x), &d) in dest.indexed_iter() {
        let v = Interp::Linear.sample(src, y as f64 + dy, x as f64 + dx) - d;
        sum += v * v;
    }
    sum / dest.len() as f64
}

fn positive_center(im: &ArrayView2<f64>) -> Option<(f64, f64)> {
    center_of_mass(&im.mapv(|v| v.max(0.0)).view())
}

/// 在步长逐渐减半的网格上搜索使均方误差下降的平移. 只接受严格更优的候选.
fn refine(src: &ArrayView2<f64>, dest: &ArrayView2<f64>, start: (f64, f64), rounds: u32) -> (f64, f64) {
    let mut best = start;
    let mut best_cost = mean_squares(src, dest, best);
    for step in SEARCH_STEPS {
        for _ in 0..rounds {
            let (by, bx) = best;
            let candidates = [(by - step, bx), (by + step, bx), (by, bx - step), (by, bx + step)];
            let mut moved = false;
            for c in candidates {
                let cost = mean_squares(src, dest, c);
                if cost < best_cost {
                    best = c;
                    best_cost = cost;
                    moved = true;
                }
            }
            if !moved {
                break;
            }
        }
    }
    best
}

impl InProcessRegistrar {
    /// 估计将 `src` 对齐到 `dest` 的平移 `(dy, dx)`, 使输出像素 `p` 取 `src(p + d)`.
    pub fn estimate(&self, src: &ArrayView2<f64>, dest: &ArrayView2<f64>, recipe: &RegistrationRecipe) -> (f64, f64) {
        let mut shift = match (positive_center(src), positive_center(dest)) {
            (Some((sy, sx)), Some((dy, dx))) => (sy - dy, sx - dx),
            _ => (0.0, 0.0),
        };
        for step in recipe.active_steps() {
            let radius = step.smooth.max(0.0).round() as usize;
            let s = box_blur(src, radius);
            let d = box_blur(dest, radius);
            shift = refine(&s.view(), &d.view(), shift, step.iter);
            debug!("Step {} ({}): shift = {shift:?}", step.step, step.kind);
        }
        shift
    }
}

impl Registrar for InProcessRegistrar {
    fn register(
        &self,
        src: &ArrayView2<f64>,
        dest: &ArrayView2<f64>,
        recipe: &RegistrationRecipe,
        work_dir: &Path,
    ) -> Result<WarpPair> {
        if src.dim() != dest.dim() {
            return Err(AtlasError::ShapeMismatch {
                expected: dest.dim(),
                got: src.dim(),
                context: "in-process registration".into(),
            });
        }
        if src.is_empty() {
            return Err(AtlasError::Registration("无法配准空图像".into()));
        }

        let shift = self.estimate(src, dest, recipe);
        let forward = DisplacementField::constant(dest.dim(), shift);
        let pair = WarpPair {
            src2dest: work_dir.join(format!("{WARP_SRC2DEST}.npy")),
            dest2src: work_dir.join(format!("{WARP_DEST2SRC}.npy")),
        };
        forward.save(&pair.src2dest)?;
        forward.negated().save(&pair.dest2src)?;
        Ok(pair)
    }

    fn apply(
        &self,
        src: &ArrayView2<f64>,
        dest: &ArrayView2<f64>,
        warp: &Path,
        interp: Interp,
        _work_dir: &Path,
    ) -> Result<Image2d> {
        let field = DisplacementField::load(warp)?;
        if field.shape() != dest.dim() {
            return Err(AtlasError::ShapeMismatch {
                expected: dest.dim(),
                got: field.shape(),
                context: format!("warp {}", warp.display()),
            });
        }
        if src.is_empty() {
            return Err(AtlasError::Registration("无法对空图像应用形变场".into()));
        }
        Ok(field.apply(src, interp))
    }
}
