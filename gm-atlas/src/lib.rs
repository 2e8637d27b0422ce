#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 从已配准的 MRI 水平切片字典构建 (并加载) 脊髓灰质/白质外观统计图谱,
//! 供新图像的灰质分割使用.
//!
//! 该 crate 目前仅提供 `safe` 接口.
//!
//! # 注意
//!
//! 1. 该 crate 只负责模型本身 (切片字典, 分组配准, 强度归一化, 降维与持久化).
//!   外部配准程序只通过 [`registration::Registrar`] 接口对接.
//! 2. 模型构建是单次、离线的批处理流程. 任何会让字典不一致的错误都会中止整个构建,
//!   不会在磁盘上留下写了一半的模型目录.
//!
//! # 开发计划
//!
//! ### 受试者目录扫描与切片提取 ✅
//!
//! 按文件名子串 (`im`, `seg`, `gm`, `level`) 识别文件, 去噪, 重采样, 以脊髓为中心裁剪.
//!
//! 实现位于 `gm-atlas/src/dataset`.
//!
//! ### 配准适配层 ✅
//!
//! 1. 多步配准参数串的解析与回写. ✅
//! 2. 纯 Rust 的平移配准实现 (位移场以 `.npy` 存储). ✅
//! 3. 外部配准程序的子进程封装, 全程显式路径, 不修改进程工作目录. ✅
//!
//! 实现位于 `gm-atlas/src/registration`.
//!
//! ### 分组配准 ✅
//!
//! 以平均白质图像为参考, 每个切片的白质配准到参考上, 再将形变场传播到灰质掩码与强度图像.
//! 切片之间相互独立, 可借助 `rayon` 有界工作池并行.
//!
//! 实现位于 `gm-atlas/src/model/coregister.rs`.
//!
//! ### 按椎体水平的强度归一化 ✅
//!
//! 实现位于 `gm-atlas/src/model/intensity.rs`.
//!
//! ### PCA / Isomap 降维 ✅
//!
//! 特征分解借助 `ndarray-linalg`; Isomap 的测地距离由 Dijkstra 计算.
//!
//! 实现位于 `gm-atlas/src/model/reduce`.
//!
//! ### 模型持久化 ✅
//!
//! 四个独立压缩工件 + 带版本号的清单. 旧模型目录会被改名为 `*_old` 而不是被覆盖.
//!
//! 实现位于 `gm-atlas/src/model/store.rs`.
//!
//! ### 推断辅助 ✅
//!
//! 新切片投影到降维空间, 查找最近邻字典切片并融合其灰质掩码.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 二维强度图像. 按 (高, 宽) 组织.
pub type Image2d = ndarray::Array2<f64>;

/// 二维标签掩码. 按 (高, 宽) 组织, 像素值只允许为
/// [`consts::label::BACKGROUND`] 或 [`consts::label::TISSUE`].
pub type Mask2d = ndarray::Array2<u8>;

pub mod config;
pub mod consts;
pub mod data;
pub mod dataset;
pub mod error;
pub mod model;
pub mod prelude;
pub mod registration;

pub use config::{AtlasConfig, DataParam, IsoComponents, Method, ModelParam, RunParam, Todo};
pub use data::{
    IntensityWindow, LabelVolume, LevelSource, NiftiHeaderAttr, Plane, Registered, ScanVolume,
    Slice,
};
pub use error::{AtlasError, Result};
pub use model::{run, IntensityTable, LevelIntensity, Model, ModelSummary, ReducedSpace};
