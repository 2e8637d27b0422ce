//! 运行时错误.

use std::path::PathBuf;

use crate::data::ParseLevelError;
use crate::registration::ParseRecipeError;

/// 模型构建/加载的统一结果类型.
pub type Result<T> = std::result::Result<T, AtlasError>;

/// 模型构建/加载错误.
///
/// 可局部吸收的情况 (缺文件的受试者, 空的椎体水平) 不会以该类型出现,
/// 而是在日志中以警告形式给出.
#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// 受试者目录内容不满足要求 (缺少强度图像或脊髓分割).
    #[error("受试者 `{subject}` 数据无效: {reason}")]
    InputData {
        /// 受试者目录名.
        subject: String,
        /// 原因.
        reason: String,
    },

    /// 字典中没有任何可用切片.
    #[error("切片字典为空: {0}")]
    EmptyDictionary(String),

    /// 图像形状不一致.
    #[error("图像形状不一致: 期望 {expected:?}, 实际 {got:?} ({context})")]
    ShapeMismatch {
        /// 期望形状.
        expected: (usize, usize),
        /// 实际形状.
        got: (usize, usize),
        /// 出错位置.
        context: String,
    },

    /// 配准或形变场应用失败.
    #[error("配准失败: {0}")]
    Registration(String),

    /// 某个切片的配准失败. 会中止整个模型构建.
    #[error("切片 {id} 配准失败")]
    SliceRegistration {
        /// 切片 id.
        id: usize,
        /// 底层错误.
        #[source]
        source: Box<AtlasError>,
    },

    /// 数值计算失败 (特征分解失败, 方差为零, 近邻图不连通等).
    #[error("数值计算失败: {0}")]
    Numerical(String),

    /// 模型目录中的工件缺失、不可读或结构不一致.
    #[error("模型数据完整性错误 ({artifact}): {reason}")]
    DataIntegrity {
        /// 工件名.
        artifact: String,
        /// 原因.
        reason: String,
    },

    /// 配置非法.
    #[error("配置非法: {0}")]
    Config(String),

    /// 配准参数串非法.
    #[error(transparent)]
    Recipe(#[from] ParseRecipeError),

    /// 椎体水平文件非法.
    #[error(transparent)]
    Level(#[from] ParseLevelError),

    /// NIfTI 读写错误.
    #[error("NIfTI 读写错误 ({path}): {source}")]
    Nifti {
        /// 文件路径.
        path: PathBuf,
        /// 底层错误.
        #[source]
        source: nifti::NiftiError,
    },

    /// 预览图像写出错误.
    #[error("图像写出错误 ({path}): {source}")]
    Image {
        /// 文件路径.
        path: PathBuf,
        /// 底层错误.
        #[source]
        source: image::ImageError,
    },

    /// 其他底层 I/O 错误.
    #[error("I/O 错误 ({path}): {source}")]
    Io {
        /// 文件路径.
        path: PathBuf,
        /// 底层错误.
        #[source]
        source: std::io::Error,
    },
}

impl AtlasError {
    /// 以 `path` 为上下文包装 I/O 错误.
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// 以 `path` 为上下文包装 NIfTI 错误.
    #[inline]
    pub fn nifti(path: impl Into<PathBuf>, source: nifti::NiftiError) -> Self {
        Self::Nifti {
            path: path.into(),
            source,
        }
    }

    /// 构造完整性错误.
    #[inline]
    pub fn integrity(artifact: &str, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            artifact: artifact.to_string(),
            reason: reason.into(),
        }
    }

    /// 是否是完整性错误.
    #[inline]
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::DataIntegrity { .. })
    }
}
