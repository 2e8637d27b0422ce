//! 模型构建参数.
//!
//! 参数分为三组: 模型参数 [`ModelParam`], 数据预处理参数 [`DataParam`] 和运行参数 [`RunParam`].
//! 三者都可以从 TOML 文件中加载, 缺省字段取默认值:
//!
//! ```toml
//! [model]
//! path_data = "/data/gmseg_dictionary"
//! todo = "compute"
//! method = "isomap"
//! n_compo_iso = "half"
//!
//! [data]
//! axial_res = 0.3
//!
//! [run]
//! verbose = 2
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_REGISTER_PARAM;
use crate::error::{AtlasError, Result};
use crate::registration::RegistrationRecipe;

/// 要执行的任务.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Todo {
    /// 从切片字典重新构建模型.
    Compute,

    /// 加载已有模型.
    #[default]
    Load,
}

/// 降维方法.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// 线性降维, 保留给定比例的方差.
    #[default]
    Pca,

    /// 基于 k-近邻图测地距离的流形嵌入.
    Isomap,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Pca => f.write_str("pca"),
            Method::Isomap => f.write_str("isomap"),
        }
    }
}

/// Isomap 嵌入维数.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "IsoComponentsRepr", into = "IsoComponentsRepr")]
pub enum IsoComponents {
    /// 切片数的一半 (向下取整).
    #[default]
    Half,

    /// 固定维数.
    Fixed(usize),
}

impl IsoComponents {
    /// 给定切片数 `n_slices`, 计算实际嵌入维数.
    #[inline]
    pub fn resolve(&self, n_slices: usize) -> usize {
        match *self {
            IsoComponents::Half => n_slices / 2,
            IsoComponents::Fixed(n) => n,
        }
    }
}

impl fmt::Display for IsoComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsoComponents::Half => f.write_str("half"),
            IsoComponents::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// `n_compo_iso` 在配置文件中的表示: `"half"` 或正整数.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum IsoComponentsRepr {
    Count(usize),
    Word(String),
}

impl TryFrom<IsoComponentsRepr> for IsoComponents {
    type Error = String;

    fn try_from(value: IsoComponentsRepr) -> std::result::Result<Self, Self::Error> {
        match value {
            IsoComponentsRepr::Count(0) => Err("n_compo_iso 必须为正整数".to_string()),
            IsoComponentsRepr::Count(n) => Ok(IsoComponents::Fixed(n)),
            IsoComponentsRepr::Word(w) if w.eq_ignore_ascii_case("half") => Ok(IsoComponents::Half),
            IsoComponentsRepr::Word(w) => match w.parse::<usize>() {
                Ok(n) if n > 0 => Ok(IsoComponents::Fixed(n)),
                _ => Err(format!("n_compo_iso 只能是 `half` 或正整数, 但发现了 `{w}`")),
            },
        }
    }
}

impl From<IsoComponents> for IsoComponentsRepr {
    fn from(value: IsoComponents) -> Self {
        match value {
            IsoComponents::Half => IsoComponentsRepr::Word("half".to_string()),
            IsoComponents::Fixed(n) => IsoComponentsRepr::Count(n),
        }
    }
}

/// 模型参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParam {
    /// 切片字典根目录, 每个受试者一个子目录.
    pub path_data: PathBuf,

    /// `compute` 或 `load`.
    pub todo: Todo,

    /// `compute` 时模型的输出目录.
    pub new_model_dir: PathBuf,

    /// `load` 时模型所在目录.
    pub path_model_to_load: PathBuf,

    /// 降维方法.
    pub method: Method,

    /// PCA 保留的方差比例, 位于 (0, 1].
    pub k_pca: f64,

    /// Isomap 嵌入维数.
    pub n_compo_iso: IsoComponents,

    /// Isomap 近邻数.
    pub n_neighbors_iso: usize,
}

impl Default for ModelParam {
    fn default() -> Self {
        Self {
            path_data: PathBuf::new(),
            todo: Todo::Load,
            new_model_dir: PathBuf::from("gmseg"),
            path_model_to_load: crate::dataset::home_dataset_dir_with(["gm_model"])
                .unwrap_or_else(|| PathBuf::from("gm_model")),
            method: Method::Pca,
            k_pca: 0.8,
            n_compo_iso: IsoComponents::Half,
            n_neighbors_iso: 5,
        }
    }
}

impl fmt::Display for ModelParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model Param:")?;
        writeln!(f, "\t- path to data: {}", self.path_data.display())?;
        writeln!(f, "\t- created folder: {}", self.new_model_dir.display())?;
        writeln!(f, "\t- used method: {}", self.method)?;
        match self.method {
            Method::Pca => writeln!(f, "\t\t-> % of variability kept for PCA: {}", self.k_pca),
            Method::Isomap => {
                writeln!(f, "\t\t-> # components for isomap: {}", self.n_compo_iso)?;
                writeln!(f, "\t\t-> # neighbors for isomap: {}", self.n_neighbors_iso)
            }
        }
    }
}

/// 数据预处理参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParam {
    /// 切片提取前是否去噪.
    pub denoising: bool,

    /// 水平面重采样分辨率, 单位 mm.
    pub axial_res: f64,

    /// 以脊髓为中心裁剪的正方形边长, 单位 mm.
    pub square_size_size_mm: f64,

    /// 多步配准参数串.
    pub register_param: String,

    /// 是否按椎体水平做强度归一化.
    pub normalization: bool,
}

impl Default for DataParam {
    fn default() -> Self {
        Self {
            denoising: true,
            axial_res: 0.3,
            square_size_size_mm: 22.5,
            register_param: DEFAULT_REGISTER_PARAM.to_string(),
            normalization: true,
        }
    }
}

impl DataParam {
    /// 裁剪后正方形切片的边长, 单位为像素.
    #[inline]
    pub fn square_px(&self) -> usize {
        ((self.square_size_size_mm / self.axial_res).round() as usize).max(1)
    }

    /// 解析配准参数串.
    #[inline]
    pub fn recipe(&self) -> Result<RegistrationRecipe> {
        Ok(self.register_param.parse()?)
    }
}

impl fmt::Display for DataParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Data Param:")?;
        writeln!(f, "\t- denoising: {}", self.denoising)?;
        writeln!(
            f,
            "\t- resampling to an axial resolution of: {}mm",
            self.axial_res
        )?;
        writeln!(
            f,
            "\t- size of the square mask: {}mm",
            self.square_size_size_mm
        )?;
        writeln!(f, "\t- registration parameters: {}", self.register_param)?;
        writeln!(f, "\t- intensity normalization: {}", self.normalization)
    }
}

/// 运行参数.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParam {
    /// 0: 仅警告, 1: 阶段进度, 2: 逐切片细节.
    pub verbose: u8,

    /// 是否删除每个切片的临时配准目录.
    pub rm_tmp: bool,

    /// 分组配准工作池大小. 0 表示使用全部可用核心.
    pub workers: usize,

    /// 临时目录根. 缺省时使用系统临时目录.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,

    /// 外部配准程序. 缺省时使用进程内配准.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_program: Option<PathBuf>,

    /// 外部形变场应用程序. 仅在设置了 `registration_program` 时有效.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply_program: Option<PathBuf>,
}

impl Default for RunParam {
    fn default() -> Self {
        Self {
            verbose: 1,
            rm_tmp: true,
            workers: 0,
            tmp_dir: None,
            registration_program: None,
            apply_program: None,
        }
    }
}

impl RunParam {
    /// 本次运行的临时目录根.
    pub fn tmp_root(&self) -> PathBuf {
        match &self.tmp_dir {
            Some(d) => d.clone(),
            None => std::env::temp_dir().join(format!("gm-atlas-{}", std::process::id())),
        }
    }

    /// `verbose` 对应的日志级别.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    }
}

/// 全部参数.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtlasConfig {
    /// 模型参数.
    pub model: ModelParam,

    /// 数据预处理参数.
    pub data: DataParam,

    /// 运行参数.
    pub run: RunParam,
}

impl AtlasConfig {
    /// 从 TOML 文本解析并校验.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(|e| AtlasError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 从 TOML 文件加载并校验.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AtlasError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// 序列化为 TOML 文本.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| AtlasError::Config(e.to_string()))
    }

    /// 检查参数取值.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let d = &self.data;
        if !(m.k_pca > 0.0 && m.k_pca <= 1.0) {
            return Err(AtlasError::Config(format!(
                "k_pca 必须位于 (0, 1], 但发现了 {}",
                m.k_pca
            )));
        }
        if m.n_neighbors_iso == 0 {
            return Err(AtlasError::Config("n_neighbors_iso 必须为正整数".into()));
        }
        if m.n_compo_iso == IsoComponents::Fixed(0) {
            return Err(AtlasError::Config("n_compo_iso 必须为正整数".into()));
        }
        if !(d.axial_res.is_finite() && d.axial_res > 0.0) {
            return Err(AtlasError::Config(format!(
                "axial_res 必须为正数, 但发现了 {}",
                d.axial_res
            )));
        }
        if !(d.square_size_size_mm.is_finite() && d.square_size_size_mm > 0.0) {
            return Err(AtlasError::Config(format!(
                "square_size_size_mm 必须为正数, 但发现了 {}",
                d.square_size_size_mm
            )));
        }
        if self.run.verbose > 2 {
            return Err(AtlasError::Config("verbose 只能为 0, 1 或 2".into()));
        }
        if self.run.apply_program.is_some() && self.run.registration_program.is_none() {
            return Err(AtlasError::Config(
                "设置了 apply_program 却没有设置 registration_program".into(),
            ));
        }
        d.recipe()?;
        Ok(())
    }
}

impl fmt::Display for AtlasConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.model, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let cfg = AtlasConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.model.method, Method::Pca);
        assert_eq!(cfg.model.todo, Todo::Load);
        assert_eq!(cfg.model.k_pca, 0.8);
        assert_eq!(cfg.model.n_compo_iso, IsoComponents::Half);
        assert_eq!(cfg.model.n_neighbors_iso, 5);
        assert!(cfg.data.denoising);
        assert_eq!(cfg.data.axial_res, 0.3);
        assert_eq!(cfg.data.square_size_size_mm, 22.5);
        assert_eq!(cfg.data.register_param, DEFAULT_REGISTER_PARAM);
        assert!(cfg.run.rm_tmp);
        assert_eq!(cfg.run.verbose, 1);
    }

    #[test]
    fn test_n_compo_iso_forms() {
        let cfg = AtlasConfig::from_toml_str("[model]\nn_compo_iso = 12\n").unwrap();
        assert_eq!(cfg.model.n_compo_iso, IsoComponents::Fixed(12));

        let cfg = AtlasConfig::from_toml_str("[model]\nn_compo_iso = \"half\"\n").unwrap();
        assert_eq!(cfg.model.n_compo_iso, IsoComponents::Half);

        assert!(AtlasConfig::from_toml_str("[model]\nn_compo_iso = 0\n").is_err());
        assert!(AtlasConfig::from_toml_str("[model]\nn_compo_iso = \"most\"\n").is_err());
    }

    #[test]
    fn test_half_truncates() {
        assert_eq!(IsoComponents::Half.resolve(51), 25);
        assert_eq!(IsoComponents::Half.resolve(50), 25);
        assert_eq!(IsoComponents::Fixed(3).resolve(50), 3);
    }

    #[test]
    fn test_invalid_values() {
        assert!(AtlasConfig::from_toml_str("[model]\nk_pca = 1.5\n").is_err());
        assert!(AtlasConfig::from_toml_str("[model]\nk_pca = 0.0\n").is_err());
        assert!(AtlasConfig::from_toml_str("[data]\naxial_res = -1.0\n").is_err());
        assert!(AtlasConfig::from_toml_str("[data]\nregister_param = \"step=2,iter=1\"\n").is_err());
        assert!(AtlasConfig::from_toml_str("[run]\nverbose = 3\n").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut cfg = AtlasConfig::default();
        cfg.model.method = Method::Isomap;
        cfg.model.n_compo_iso = IsoComponents::Fixed(7);
        cfg.run.workers = 3;
        let text = cfg.to_toml_string().unwrap();
        assert_eq!(AtlasConfig::from_toml_str(&text).unwrap(), cfg);
    }

    #[test]
    fn test_info_text() {
        let mut cfg = AtlasConfig::default();
        cfg.model.method = Method::Isomap;
        let info = cfg.to_string();
        assert!(info.contains("used method: isomap"));
        assert!(info.contains("# neighbors for isomap: 5"));
        assert!(info.contains("registration parameters: step=1"));
    }

    #[test]
    fn test_square_px() {
        let d = DataParam::default();
        assert_eq!(d.square_px(), 75);
    }
}
