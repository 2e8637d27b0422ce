//! 二维图像配准适配层.
//!
//! 分组配准只依赖 [`Registrar`] 接口: 计算一对前向/逆向形变场文件,
//! 以及把给定形变场以指定插值方式应用到任意图像上. 所有中间文件都写在调用方给出的
//! 工作目录中, 不依赖进程的当前工作目录.

use std::path::{Path, PathBuf};

use ndarray::ArrayView2;

use crate::config::AtlasConfig;
use crate::error::Result;
use crate::Image2d;

pub mod external;
pub mod field;
pub mod local;
pub mod recipe;

pub use crate::data::Interp;
pub use external::ExternalRegistrar;
pub use field::DisplacementField;
pub use local::InProcessRegistrar;
pub use recipe::{ParseRecipeError, RegStep, RegistrationRecipe, StepKind};

/// 一次配准得到的形变场文件.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WarpPair {
    /// 源图像到目标图像的形变场.
    pub src2dest: PathBuf,

    /// 目标图像到源图像的形变场.
    pub dest2src: PathBuf,
}

/// 配准实现.
///
/// 实现必须可以在多个线程中同时调用, 且只能读写 `work_dir` 中的文件.
pub trait Registrar: Sync {
    /// 将 `src` 配准到 `dest`, 形变场写入 `work_dir`.
    fn register(
        &self,
        src: &ArrayView2<f64>,
        dest: &ArrayView2<f64>,
        recipe: &RegistrationRecipe,
        work_dir: &Path,
    ) -> Result<WarpPair>;

    /// 将形变场 `warp` 应用到 `src` 上, 输出位于 `dest` 的像素网格.
    fn apply(
        &self,
        src: &ArrayView2<f64>,
        dest: &ArrayView2<f64>,
        warp: &Path,
        interp: Interp,
        work_dir: &Path,
    ) -> Result<Image2d>;
}

/// 按配置选择配准实现: 设置了外部程序时使用 [`ExternalRegistrar`], 否则使用 [`InProcessRegistrar`].
pub fn registrar_from_config(cfg: &AtlasConfig) -> Box<dyn Registrar> {
    match &cfg.run.registration_program {
        Some(program) => Box::new(ExternalRegistrar::new(
            program,
            cfg.run
                .apply_program
                .clone()
                .unwrap_or_else(|| PathBuf::from(crate::consts::DEFAULT_APPLY_PROGRAM)),
            cfg.data.axial_res,
        )),
        None => Box::new(InProcessRegistrar),
    }
}
