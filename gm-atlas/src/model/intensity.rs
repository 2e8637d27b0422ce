//! 按椎体水平的强度统计与归一化.
//!
//! 对每个水平, 统计该水平所有切片 (配准后) 的灰质/白质强度中位数的均值, 以及强度的最小值/最大值.
//! 归一化时, 将切片自身的灰质/白质中位数线性映射到所在水平的灰质/白质中位数,
//! 再钳制到该水平的强度范围内.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, warn};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::data::image::{masked_median, min_max};
use crate::data::{Registered, Slice};
use crate::error::{AtlasError, Result};
use crate::{Image2d, Mask2d};

/// 单个椎体水平的强度统计.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelIntensity {
    /// 灰质强度中位数的均值.
    pub gm: f64,

    /// 白质强度中位数的均值.
    pub wm: f64,

    /// 强度最小值.
    pub min: f64,

    /// 强度最大值.
    pub max: f64,
}

impl LevelIntensity {
    /// 四个统计量均为有限值, 且 `min <= max`.
    #[inline]
    pub fn is_valid(&self) -> bool {
        [self.gm, self.wm, self.min, self.max].iter().all(|v| v.is_finite()) && self.min <= self.max
    }
}

/// 每个非空掩码内的强度中位数. 空掩码被忽略.
fn medians(im: &ArrayView2<f64>, masks: &[Mask2d]) -> Vec<f64> {
    masks
        .iter()
        .filter_map(|m| masked_median(im, &m.view()))
        .collect()
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// 椎体水平 (四舍五入后) 到强度统计的映射.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntensityTable {
    levels: BTreeMap<i32, LevelIntensity>,
}

impl IntensityTable {
    /// 从已配准的切片字典统计.
    ///
    /// 灰质或白质中位数列表为空的水平不会出现在表中, 并给出警告.
    /// 存在未配准的切片时返回 `Err`.
    pub fn compute(slices: &[Slice]) -> Result<Self> {
        let mut by_level = BTreeMap::new();
        for s in slices {
            let reg = s.registered().ok_or_else(|| {
                AtlasError::Numerical(format!("切片 {} 尚未配准, 无法统计强度", s.id()))
            })?;
            by_level
                .entry(s.level_bucket())
                .or_insert_with(Vec::new)
                .push(reg);
        }

        let mut levels = BTreeMap::new();
        for (level, regs) in by_level {
            let im_views = regs.iter().map(|r| r.im.view()).collect_vec();
            let med_gm = regs
                .iter()
                .flat_map(|r| medians(&r.im.view(), &r.gm_seg))
                .collect_vec();
            let med_wm = regs
                .iter()
                .flat_map(|r| medians(&r.im.view(), &r.wm_seg))
                .collect_vec();
            let bounds = im_views
                .iter()
                .filter_map(min_max)
                .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)));

            match (mean(&med_gm), mean(&med_wm), bounds) {
                (Some(gm), Some(wm), Some((min, max))) => {
                    debug!(
                        "Level {level}: {} slices, gm = {gm:.3}, wm = {wm:.3}, range = [{min:.3}, {max:.3}]",
                        regs.len()
                    );
                    levels.insert(level, LevelIntensity { gm, wm, min, max });
                }
                _ => warn!(
                    "Level {level} skipped: {} gm medians, {} wm medians over {} slices",
                    med_gm.len(),
                    med_wm.len(),
                    regs.len()
                ),
            }
        }
        Ok(Self { levels })
    }

    /// 某个水平的统计.
    #[inline]
    pub fn get(&self, level: i32) -> Option<&LevelIntensity> {
        self.levels.get(&level)
    }

    /// 按水平升序迭代.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (i32, &LevelIntensity)> {
        self.levels.iter().map(|(&l, v)| (l, v))
    }

    /// 水平个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// 表是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// 第一个统计量非法的水平. 见 [`LevelIntensity::is_valid`].
    pub fn invalid_level(&self) -> Option<i32> {
        self.iter().find(|(_, v)| !v.is_valid()).map(|(l, _)| l)
    }

    /// 按 `level` 水平的统计归一化图像 `im`. `gm` 与 `wm` 为该图像上的掩码.
    ///
    /// 表中没有该水平或该水平的统计非法, 掩码为空, 或者图像的灰质/白质对比度为零时返回 `None`.
    pub fn normalize_image(&self, level: i32, im: &ArrayView2<f64>, gm: &[Mask2d], wm: &[Mask2d]) -> Option<Image2d> {
        let entry = self.get(level).filter(|e| e.is_valid())?;
        let med_gm = mean(&medians(im, gm))?;
        let med_wm = mean(&medians(im, wm))?;

        let a = (med_wm - med_gm) / (entry.wm - entry.gm);
        if !a.is_finite() || a == 0.0 {
            return None;
        }
        let b = med_wm - a * entry.wm;
        Some(im.mapv(|v| ((v - b) / a).clamp(entry.min, entry.max)))
    }

    /// 原地归一化一个切片的配准图像. 成功时返回 `true`.
    pub fn normalize_registered(&self, level: i32, reg: &mut Registered) -> bool {
        match self.normalize_image(level, &reg.im.view(), &reg.gm_seg, &reg.wm_seg) {
            Some(im) => {
                reg.im = im;
                reg.normalized = true;
                true
            }
            None => false,
        }
    }

    /// 归一化字典中的每个切片, 返回成功归一化的切片数. 无法归一化的切片保持不变, 并给出警告.
    pub fn normalize_all(&self, slices: &mut [Slice]) -> usize {
        let mut done = 0;
        for s in slices.iter_mut() {
            let (id, level) = (s.id(), s.level_bucket());
            let ok = s
                .registered_mut()
                .map_or(false, |reg| self.normalize_registered(level, reg));
            if ok {
                done += 1;
            } else {
                warn!("Slice {id} (level {level}) left unnormalized");
            }
        }
        done
    }
}

impl FromIterator<(i32, LevelIntensity)> for IntensityTable {
    fn from_iter<T: IntoIterator<Item = (i32, LevelIntensity)>>(iter: T) -> Self {
        Self {
            levels: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    /// 左列为灰质, 右列为白质.
    fn registered(gm_value: f64, wm_value: f64) -> Registered {
        let im = array![[gm_value, wm_value], [gm_value, wm_value]];
        Registered {
            im,
            wm_seg: vec![array![[0u8, 1], [0, 1]]],
            gm_seg: vec![array![[1u8, 0], [1, 0]]],
            normalized: false,
        }
    }

    fn slice(id: usize, level: f64, gm_value: f64, wm_value: f64) -> Slice {
        let im = Array2::<f64>::zeros((2, 2));
        let mut s = Slice::new(id, "s", id, level, im, vec![array![[0u8, 1], [0, 1]]], vec![]);
        s.set_registered(registered(gm_value, wm_value));
        s
    }

    #[test]
    fn test_compute_groups_by_rounded_level() {
        let slices = vec![
            slice(0, 4.6, 10.0, 20.0),
            slice(1, 5.2, 30.0, 40.0),
            slice(2, 7.0, 1.0, 2.0),
        ];
        let table = IntensityTable::compute(&slices).unwrap();
        assert_eq!(table.len(), 2);
        let l5 = table.get(5).unwrap();
        assert_eq!(l5.gm, 20.0);
        assert_eq!(l5.wm, 30.0);
        assert_eq!(l5.min, 10.0);
        assert_eq!(l5.max, 40.0);
        assert_eq!(table.get(7).unwrap().gm, 1.0);
        assert!(table.get(6).is_none());
    }

    #[test]
    fn test_level_without_gm_is_skipped() {
        let mut s = slice(0, 3.0, 1.0, 2.0);
        s.registered_mut().unwrap().gm_seg.clear();
        let slices = vec![s, slice(1, 4.0, 1.0, 2.0)];
        let table = IntensityTable::compute(&slices).unwrap();
        assert!(table.get(3).is_none());
        assert!(table.get(4).is_some());
    }

    #[test]
    fn test_unregistered_slice_is_error() {
        let s = Slice::new(0, "s", 0, 1.0, Array2::zeros((2, 2)), vec![Array2::zeros((2, 2))], vec![]);
        assert!(IntensityTable::compute(&[s]).is_err());
    }

    #[test]
    fn test_normalize_maps_medians() {
        let slices = vec![slice(0, 5.0, 10.0, 20.0), slice(1, 5.0, 30.0, 60.0)];
        let table = IntensityTable::compute(&slices).unwrap();
        let l5 = *table.get(5).unwrap();
        assert_eq!((l5.gm, l5.wm), (20.0, 40.0));

        let mut reg = registered(30.0, 60.0);
        assert!(table.normalize_registered(5, &mut reg));
        assert!(reg.normalized);
        assert_eq!(reg.im, array![[20.0, 40.0], [20.0, 40.0]]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let slices = vec![slice(0, 5.0, 10.0, 25.0), slice(1, 5.0, 14.0, 31.0)];
        let table = IntensityTable::compute(&slices).unwrap();

        let mut reg = registered(14.0, 31.0);
        reg.im[(0, 0)] = 13.0;
        assert!(table.normalize_registered(5, &mut reg));
        let once = reg.im.clone();
        assert!(table.normalize_registered(5, &mut reg));
        assert!(once.iter().zip(reg.im.iter()).all(|(a, b)| (a - b).abs() < 1e-9));
    }

    #[test]
    fn test_normalize_clamps_and_rejects() {
        let slices = vec![slice(0, 5.0, 10.0, 20.0)];
        let table = IntensityTable::compute(&slices).unwrap();

        // 对比度被放大后超出该水平的强度范围.
        let mut reg = registered(10.0, 20.0);
        reg.im[(0, 0)] = -100.0;
        assert!(table.normalize_registered(5, &mut reg));
        assert_eq!(reg.im[(0, 0)], 10.0);

        // 灰质与白质强度相同, 无法归一化.
        let mut flat = registered(5.0, 5.0);
        assert!(!table.normalize_registered(5, &mut flat));
        assert!(!flat.normalized);
        // 表中没有该水平.
        assert!(!table.normalize_registered(9, &mut registered(1.0, 2.0)));
    }

    #[test]
    fn test_invalid_level_is_not_normalized() {
        let bad = [
            LevelIntensity { gm: 20.0, wm: 40.0, min: 50.0, max: 10.0 },
            LevelIntensity { gm: 20.0, wm: 40.0, min: f64::NAN, max: 50.0 },
            LevelIntensity { gm: f64::INFINITY, wm: 40.0, min: 0.0, max: 50.0 },
        ];
        for entry in bad {
            assert!(!entry.is_valid());
            let table: IntensityTable = [(5, entry)].into_iter().collect();
            assert_eq!(table.invalid_level(), Some(5));
            let mut reg = registered(30.0, 60.0);
            assert!(!table.normalize_registered(5, &mut reg));
            assert_eq!(reg.im, registered(30.0, 60.0).im);
        }

        let good = LevelIntensity { gm: 20.0, wm: 40.0, min: 0.0, max: 50.0 };
        let table: IntensityTable = [(4, good), (5, bad[0])].into_iter().collect();
        assert_eq!(table.invalid_level(), Some(5));
        assert!(table.normalize_registered(4, &mut registered(30.0, 60.0)));
    }

    #[test]
    fn test_normalize_all_counts() {
        let mut slices = vec![slice(0, 5.0, 10.0, 20.0), slice(1, 5.0, 30.0, 60.0), slice(2, 6.0, 3.0, 3.0)];
        let table = IntensityTable::compute(&slices).unwrap();
        assert_eq!(table.normalize_all(&mut slices), 2);
        assert!(!slices[2].registered().unwrap().normalized);
    }
}
