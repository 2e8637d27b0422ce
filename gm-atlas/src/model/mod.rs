//! 灰质/白质统计模型.
//!
//! [`Model`] 聚合了切片字典, 平均图像, 强度表和降维空间, 以及构建它们所用的参数.
//! 构建流程严格按阶段顺序执行: 切片提取, 分组配准, 强度归一化, 降维, 保存.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use itertools::Itertools;
use log::{debug, info, warn};
use ndarray::ArrayView2;
use ordered_float::OrderedFloat;

use crate::config::{AtlasConfig, Method, Todo};
use crate::data::image::mean_stack;
use crate::data::Slice;
use crate::dataset::{extract_dictionary, ExtractParam};
use crate::error::{AtlasError, Result};
use crate::registration::{registrar_from_config, Registrar};
use crate::{Idx2d, Image2d, Mask2d};

pub mod coregister;
pub mod intensity;
pub mod reduce;
mod store;

pub use coregister::{coregister, CoregisterParam};
pub use intensity::{IntensityTable, LevelIntensity};
pub use reduce::{FittedReduction, ReducedSpace};
pub use store::{old_dir_of, Manifest};

/// 构建好的 (或加载的) 模型.
#[derive(Clone, Debug)]
pub struct Model {
    config: AtlasConfig,
    slices: Vec<Slice>,
    mean_image: Image2d,
    intensities: IntensityTable,
    reduced: ReducedSpace,
}

/// 模型概况.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSummary {
    /// 降维方法.
    pub method: Method,

    /// 保留的维数.
    pub n_components: usize,

    /// 切片数.
    pub n_slices: usize,

    /// 受试者数.
    pub n_subjects: usize,

    /// 强度表中的椎体水平数.
    pub n_levels: usize,

    /// 平均图像形状.
    pub mean_shape: Idx2d,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model summary:")?;
        writeln!(f, "\t- method: {}", self.method)?;
        writeln!(
            f,
            "\t- {} components kept on {} slices ({} subjects)",
            self.n_components, self.n_slices, self.n_subjects
        )?;
        writeln!(f, "\t- {} vertebral levels in the intensity table", self.n_levels)?;
        writeln!(f, "\t- mean image: {:?}", self.mean_shape)
    }
}

/// 执行 `cfg` 中指定的任务.
pub fn run(cfg: &AtlasConfig) -> Result<Model> {
    match cfg.model.todo {
        Todo::Compute => Model::compute(cfg),
        Todo::Load => Model::load(&cfg.model.path_model_to_load),
    }
}

impl Model {
    /// 按 `cfg` 构建模型, 并保存到 `cfg.model.new_model_dir`.
    pub fn compute(cfg: &AtlasConfig) -> Result<Self> {
        let registrar = registrar_from_config(cfg);
        let model = Self::build(cfg, registrar.as_ref())?;
        model.save(&cfg.model.new_model_dir)?;
        Ok(model)
    }

    /// 用给定的配准实现构建模型. 不写模型目录.
    pub fn build(cfg: &AtlasConfig, registrar: &dyn Registrar) -> Result<Self> {
        cfg.validate()?;
        let recipe = cfg.data.recipe()?;

        info!("Extracting slices from {}", cfg.model.path_data.display());
        let mut slices = extract_dictionary(&cfg.model.path_data, &ExtractParam::from(&cfg.data))?;

        let tmp_root = cfg.run.tmp_root();
        let param = CoregisterParam {
            recipe: &recipe,
            tmp_root: &tmp_root,
            rm_tmp: cfg.run.rm_tmp,
            workers: cfg.run.workers,
        };
        let registered = coregister(&mut slices, registrar, &param);
        if cfg.run.rm_tmp && cfg.run.tmp_dir.is_none() && tmp_root.exists() {
            if let Err(e) = fs::remove_dir_all(&tmp_root) {
                warn!("Failed to remove {}: {e}", tmp_root.display());
            }
        }
        registered?;

        let intensities = IntensityTable::compute(&slices)?;
        if cfg.data.normalization {
            let n = intensities.normalize_all(&mut slices);
            info!("Normalized {n}/{} slices over {} levels", slices.len(), intensities.len());
        }

        let images = slices
            .iter()
            .map(|s| {
                s.registered_im()
                    .map(|im| im.view())
                    .ok_or_else(|| AtlasError::Numerical(format!("切片 {} 没有配准图像", s.id())))
            })
            .collect::<Result<Vec<_>>>()?;
        let data = reduce::flatten_rows(images)?;
        info!("Fitting {} on a {:?} matrix", cfg.model.method, data.dim());
        let reduced = ReducedSpace::fit(&data.view(), &cfg.model)?;
        info!(
            "Reduced space: {} components for {} slices",
            reduced.n_components(),
            reduced.n_rows()
        );

        let mean_image = mean_stack(slices.iter().map(|s| s.im().view()))?;
        Ok(Self {
            config: cfg.clone(),
            slices,
            mean_image,
            intensities,
            reduced,
        })
    }

    /// 保存到 `dir`. 已有的模型目录会被改名为 `*_old`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        store::save(dir.as_ref(), self)
    }

    /// 从 `dir` 加载模型.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        store::load(dir.as_ref())
    }

    /// 构建参数.
    #[inline]
    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// 切片字典. 切片 id 即下标.
    #[inline]
    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// 所有切片原始图像的逐像素均值.
    #[inline]
    pub fn mean_image(&self) -> &Image2d {
        &self.mean_image
    }

    /// 强度表.
    #[inline]
    pub fn intensities(&self) -> &IntensityTable {
        &self.intensities
    }

    /// 降维空间.
    #[inline]
    pub fn reduced(&self) -> &ReducedSpace {
        &self.reduced
    }

    /// 模型概况.
    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            method: self.reduced.method(),
            n_components: self.reduced.n_components(),
            n_slices: self.slices.len(),
            n_subjects: self.slices.iter().map(Slice::subject).unique().count(),
            n_levels: self.intensities.len(),
            mean_shape: self.mean_image.dim(),
        }
    }

    /// 每个椎体水平上配准后灰质掩码与白质掩码的均值图像 `(gm, wm)`.
    ///
    /// 缺少灰质或白质掩码的水平不出现在结果中.
    pub fn gm_wm_by_level(&self) -> BTreeMap<i32, (Image2d, Image2d)> {
        let mut ret = BTreeMap::new();
        let by_level = self
            .slices
            .iter()
            .filter_map(|s| s.registered().map(|r| (s.level_bucket(), r)))
            .into_group_map();
        for (level, regs) in by_level {
            let gm = regs.iter().filter_map(|r| r.mean_gm()).collect_vec();
            let wm = regs.iter().filter_map(|r| r.mean_wm()).collect_vec();
            match (
                mean_stack(gm.iter().map(|m| m.view())),
                mean_stack(wm.iter().map(|m| m.view())),
            ) {
                (Ok(gm), Ok(wm)) => {
                    ret.insert(level, (gm, wm));
                }
                _ => debug!("Level {level} has no gm or wm mask"),
            }
        }
        ret
    }

    /// 以模型的强度表归一化一张新的 (已配准的) 切片图像.
    #[inline]
    pub fn normalize_new(&self, level: i32, im: &ArrayView2<f64>, gm: &[Mask2d], wm: &[Mask2d]) -> Option<Image2d> {
        self.intensities.normalize_image(level, im, gm, wm)
    }

    /// 在降维空间中离 `im` 最近的 `k` 个字典切片的 id, 按距离升序.
    ///
    /// `im` 应与字典切片处于同一配准空间, 并做过同样的强度归一化.
    pub fn nearest_slices(&self, im: &ArrayView2<f64>, k: usize) -> Result<Vec<usize>> {
        let y = self.reduced.transform(im)?;
        let coords = self.reduced.coords();
        let ids = coords
            .outer_iter()
            .enumerate()
            .map(|(i, row)| {
                let d: f64 = row.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (OrderedFloat(d), i)
            })
            .sorted()
            .take(k)
            .map(|(_, i)| i)
            .collect();
        Ok(ids)
    }

    /// 融合 `ids` 对应切片的配准后灰质掩码 (逐像素均值).
    pub fn fuse_gm(&self, ids: &[usize]) -> Result<Image2d> {
        let mut masks = Vec::with_capacity(ids.len());
        for &id in ids {
            let s = self
                .slices
                .get(id)
                .ok_or_else(|| AtlasError::Numerical(format!("切片 id {id} 超出字典范围 {}", self.slices.len())))?;
            if let Some(gm) = s.registered().and_then(|r| r.mean_gm()) {
                masks.push(gm);
            }
        }
        mean_stack(masks.iter().map(|m| m.view()))
    }
}
