//! 受试者目录扫描.
//!
//! 提供迭代器风格的受试者获取模式.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AtlasError, Result};

/// 某个受试者目录中识别出的文件.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubjectFiles {
    /// 受试者目录名.
    pub name: String,

    /// 强度图像 (文件名含 `im`).
    pub im: PathBuf,

    /// 脊髓分割 (文件名含 `seg` 且不含 `gm`).
    pub seg: PathBuf,

    /// 人工灰质分割 (文件名含 `gm`), 按文件名排序.
    pub gm: Vec<PathBuf>,

    /// 椎体水平来源 (文件名含 `level`).
    pub level: Option<PathBuf>,
}

impl SubjectFiles {
    /// 按文件名子串识别 `dir` 中的文件.
    ///
    /// 文件名含 `level` 的文件只作为椎体水平来源; 其余文件依次按 `gm`, `seg`, `im` 匹配.
    /// 同一类别出现多个候选时取文件名排序后的最后一个 (灰质分割除外).
    /// 缺少强度图像或脊髓分割时返回 [`AtlasError::InputData`].
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut files = fs::read_dir(dir)
            .map_err(|e| AtlasError::io(dir, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect::<Vec<_>>();
        files.sort();

        let (mut im, mut seg, mut gm, mut level) = (None, None, Vec::new(), None);
        for path in files {
            let file_name = match path.file_name() {
                Some(n) => n.to_string_lossy().to_lowercase(),
                None => continue,
            };
            if file_name.starts_with('.') {
                continue;
            }
            if file_name.contains("level") {
                level = Some(path);
            } else if file_name.contains("gm") {
                gm.push(path);
            } else if file_name.contains("seg") {
                seg = Some(path);
            } else if file_name.contains("im") {
                im = Some(path);
            }
        }

        let missing = |what: &str| AtlasError::InputData {
            subject: name.clone(),
            reason: format!("找不到{what}文件"),
        };
        let im = im.ok_or_else(|| missing("强度图像 (im)"))?;
        let seg = seg.ok_or_else(|| missing("脊髓分割 (seg)"))?;
        Ok(Self {
            name,
            im,
            seg,
            gm,
            level,
        })
    }
}

/// 获取 `root` 下按名称排序的全部子目录.
pub fn subject_dirs<P: AsRef<Path>>(root: P) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    let mut dirs = fs::read_dir(root)
        .map_err(|e| AtlasError::io(root, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect::<Vec<_>>();
    dirs.sort();
    Ok(dirs)
}

/// 从数据根目录创建受试者加载器.
///
/// 受试者按目录名升序给出, 以保证切片 id 的分配在多次运行之间一致.
pub fn subject_loader<P: AsRef<Path>>(root: P) -> Result<SubjectLoader> {
    let mut dirs = subject_dirs(root)?;
    dirs.reverse();
    Ok(SubjectLoader { dirs_rev: dirs })
}

/// 受试者加载器. 每次迭代给出目录路径及其识别结果.
#[derive(Debug)]
pub struct SubjectLoader {
    dirs_rev: Vec<PathBuf>,
}

impl Iterator for SubjectLoader {
    type Item = (PathBuf, Result<SubjectFiles>);

    fn next(&mut self) -> Option<Self::Item> {
        let dir = self.dirs_rev.pop()?;
        let files = SubjectFiles::discover(&dir);
        Some((dir, files))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.dirs_rev.len(), Some(self.dirs_rev.len()))
    }
}

impl ExactSizeIterator for SubjectLoader {
    #[inline]
    fn len(&self) -> usize {
        self.dirs_rev.len()
    }
}
