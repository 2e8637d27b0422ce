//! 椎体水平来源.
//!
//! 受试者目录中名称含 `level` 的文件给出每个水平切片所处的椎体水平.
//! 它既可以是一张标签图像 (体素值即椎体编号), 也可以是逐行 `<z> <level>` 的文本文件.
//! 文本中的水平可以写成数字, 也可以写成椎体名 (`C3`, `T1`, `L2` ...).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use ndarray::ArrayView2;

use super::image::median;
use super::{LabelVolume, NiftiHeaderAttr};
use crate::consts::label::TISSUE;
use crate::consts::VERTEBRA_SEGMENTS;
use crate::error::{AtlasError, Result};

/// 解析椎体水平文本错误.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ParseLevelError {
    /// 某一行不是 `<z> <level>` 形式.
    #[error("椎体水平文件第 {line} 行格式错误: `{content}`")]
    MalformedLine {
        /// 行号, 从 1 开始.
        line: usize,
        /// 原始内容.
        content: String,
    },

    /// 无法识别的椎体名.
    #[error("无法识别的椎体名 `{0}`")]
    UnknownVertebra(String),
}

/// 将椎体名或数字解析为数值水平.
///
/// `C1..C7` 对应 1..7, `T1..T12` 对应 8..19, `L1..L5` 对应 20..24, `S1..` 从 25 开始.
pub fn parse_vertebra(text: &str) -> std::result::Result<f64, ParseLevelError> {
    let text = text.trim();
    if let Ok(v) = text.parse::<f64>() {
        return Ok(v);
    }
    let unknown = || ParseLevelError::UnknownVertebra(text.to_string());
    let mut chars = text.chars();
    let head = chars.next().ok_or_else(unknown)?.to_ascii_uppercase();
    let n: i32 = chars.as_str().parse().map_err(|_| unknown())?;
    let &(_, first, count) = VERTEBRA_SEGMENTS
        .iter()
        .find(|(c, ..)| *c == head)
        .ok_or_else(unknown)?;
    if n < 1 || n > count {
        return Err(unknown());
    }
    Ok((first + n - 1) as f64)
}

/// 每个水平切片的椎体水平来源.
#[derive(Debug, Clone, Default)]
pub enum LevelSource {
    /// 椎体水平标签图像.
    Image(LabelVolume),

    /// 切片序号到椎体水平的映射.
    Text(BTreeMap<usize, f64>),

    /// 无来源. 所有切片的水平记为 0.
    #[default]
    None,
}

impl FromStr for LevelSource {
    type Err = ParseLevelError;

    /// 解析 `<z> <level>` 文本. 空行与 `#` 开头的行被忽略.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut map = BTreeMap::new();
        for (i, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let malformed = || ParseLevelError::MalformedLine {
                line: i + 1,
                content: line.to_string(),
            };
            let mut parts = line.split(|c: char| c.is_whitespace() || c == ',');
            let z = parts
                .next()
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or_else(malformed)?;
            let level = parts.find(|t| !t.is_empty()).ok_or_else(malformed)?;
            map.insert(z, parse_vertebra(level)?);
        }
        Ok(Self::Text(map))
    }
}

impl LevelSource {
    /// 打开椎体水平文件. `.nii` / `.nii.gz` 按标签图像读取, 其余按文本读取.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name.ends_with(".nii") || name.ends_with(".nii.gz") {
            Ok(Self::Image(LabelVolume::open(path)?))
        } else {
            let text = fs::read_to_string(path).map_err(|e| AtlasError::io(path, e))?;
            Ok(text.parse()?)
        }
    }

    /// 第 `z` 个水平切片的椎体水平.
    ///
    /// 对标签图像, 取 `cord` 内非零标签的中位数; 若脊髓内没有标签, 则取整张切片上非零标签的中位数.
    /// 对文本, 取序号最接近 `z` 的记录. 无法确定时返回 0.
    pub fn level_at(&self, z: usize, cord: Option<&ArrayView2<u8>>) -> f64 {
        match self {
            LevelSource::Image(vol) => {
                if z >= vol.len_z() {
                    return 0.0;
                }
                let sli = vol.slice_at(z);
                let inside = cord
                    .filter(|c| c.dim() == sli.dim())
                    .map(|c| {
                        sli.iter()
                            .zip(c.iter())
                            .filter(|&(&l, &m)| l != 0 && m == TISSUE)
                            .map(|(&l, _)| l as f64)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let mut values = if inside.is_empty() {
                    sli.iter().filter(|&&l| l != 0).map(|&l| l as f64).collect()
                } else {
                    inside
                };
                median(&mut values).unwrap_or(0.0)
            }
            LevelSource::Text(map) => {
                let after = map.range(z..).next();
                let before = map.range(..z).next_back();
                match (before, after) {
                    (None, None) => 0.0,
                    (Some((_, &l)), None) | (None, Some((_, &l))) => l,
                    (Some((&zb, &lb)), Some((&za, &la))) => {
                        if za - z < z - zb {
                            la
                        } else {
                            lb
                        }
                    }
                }
            }
            LevelSource::None => 0.0,
        }
    }
}
