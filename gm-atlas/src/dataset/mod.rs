//! 切片字典数据集操作.
//!
//! 数据根目录下每个受试者一个子目录, 目录内文件按文件名子串识别.

use std::path::{Path, PathBuf};

pub mod extract;
pub mod subject;

pub use extract::{extract_dictionary, extract_subject, ExtractParam};
pub use subject::{subject_loader, SubjectFiles, SubjectLoader};

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}
