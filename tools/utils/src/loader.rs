//! 对 `gm-atlas` 配置与数据目录的更一层封装.

use gm_atlas::{AtlasConfig, Result};
use std::env;
use std::path::{Path, PathBuf};

/// `$HOME/dataset/{sub}`; 无法获得用户主目录时退化为相对路径 `sub`.
fn home_or_relative(sub: &str) -> PathBuf {
    gm_atlas::dataset::home_dataset_dir_with([sub]).unwrap_or_else(|| PathBuf::from(sub))
}

fn from_env_or_home(key: &str, sub: &str) -> PathBuf {
    match env::var_os(key) {
        Some(d) if !d.is_empty() => PathBuf::from(d),
        _ => home_or_relative(sub),
    }
}

/// 获取配置文件路径.
///
/// 1. 若环境变量 `$GM_ATLAS_CONFIG` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/gm_atlas.toml`.
pub fn config_path_from_env_or_home() -> PathBuf {
    from_env_or_home("GM_ATLAS_CONFIG", "gm_atlas.toml")
}

/// 获取切片字典根目录.
///
/// 1. 若环境变量 `$GM_ATLAS_DATA_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/gmseg_dictionary`.
pub fn data_dir_from_env_or_home() -> PathBuf {
    from_env_or_home("GM_ATLAS_DATA_DIR", "gmseg_dictionary")
}

/// 获取待加载模型目录.
///
/// 1. 若环境变量 `$GM_ATLAS_MODEL_DIR` 非空, 则返回其值;
/// 2. 否则, 返回 `$HOME/dataset/gm_model`.
pub fn model_dir_from_env_or_home() -> PathBuf {
    from_env_or_home("GM_ATLAS_MODEL_DIR", "gm_model")
}

/// 加载配置.
///
/// 配置文件路径为 `path`, 缺省时使用 [`config_path_from_env_or_home`];
/// 缺省路径下没有文件时使用默认配置. 配置中没有给出的目录由环境变量或默认目录补全.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<AtlasConfig> {
    let mut cfg = match path {
        Some(p) => AtlasConfig::from_file(p)?,
        None => {
            let p = config_path_from_env_or_home();
            if p.is_file() {
                AtlasConfig::from_file(p)?
            } else {
                AtlasConfig::default()
            }
        }
    };
    if cfg.model.path_data.as_os_str().is_empty() {
        cfg.model.path_data = data_dir_from_env_or_home();
    }
    if env::var_os("GM_ATLAS_MODEL_DIR").is_some_and(|d| !d.is_empty()) {
        cfg.model.path_model_to_load = model_dir_from_env_or_home();
    }
    Ok(cfg)
}
