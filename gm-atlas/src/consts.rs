//! 通用常量.

/// 单通道标签.
pub mod label {
    /// 掩码中, 背景的像素值.
    pub const BACKGROUND: u8 = 0;

    /// 掩码中, 目标组织 (白质/灰质/脊髓) 的像素值.
    pub const TISSUE: u8 = 1;

    /// 像素是否是目标组织?
    #[inline]
    pub const fn is_tissue(p: u8) -> bool {
        matches!(p, TISSUE)
    }

    /// 像素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, BACKGROUND)
    }
}

/// 模型文件名.
pub mod files {
    /// 切片字典工件.
    pub const SLICES: &str = "slices.binz";

    /// 强度表工件.
    pub const INTENSITIES: &str = "intensities.binz";

    /// 降维模型工件.
    pub const FITTED_MODEL: &str = "fitted_model.binz";

    /// 降维坐标工件.
    pub const FITTED_DATA: &str = "fitted_data.binz";

    /// 清单.
    pub const MANIFEST: &str = "manifest.toml";

    /// 人类可读的构建参数.
    pub const INFO: &str = "info.txt";

    /// 平均图像预览.
    pub const MEAN_PREVIEW: &str = "mean_image.png";

    /// 前向位移场 (源 -> 目标).
    pub const WARP_SRC2DEST: &str = "warp_src2dest";

    /// 逆向位移场 (目标 -> 源).
    pub const WARP_DEST2SRC: &str = "warp_dest2src";
}

/// 模型目录格式版本. 结构不兼容的修改必须递增该值.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// 默认的三步配准参数.
pub const DEFAULT_REGISTER_PARAM: &str = "step=1,type=seg,algo=columnwise,metric=MeanSquares,smooth=5,iter=1:step=2,type=im,algo=syn,smooth=2,metric=MI,iter=4:step=3,iter=0";

/// 椎体名称前缀及该段第一节椎体对应的整数水平.
///
/// `C1` 为 1, `T1` 为 8, `L1` 为 20, `S1` 为 25.
pub const VERTEBRA_SEGMENTS: [(char, i32, i32); 4] =
    [('C', 1, 7), ('T', 8, 12), ('L', 20, 5), ('S', 25, 5)];

/// 未配置 `apply_program` 时使用的外部形变场应用程序.
pub const DEFAULT_APPLY_PROGRAM: &str = "sct_apply_transfo";
