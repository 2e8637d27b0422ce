//! 字典切片.

use serde::{Deserialize, Serialize};

use super::image::{mask_to_image, mean_stack};
use crate::error::Result;
use crate::{Idx2d, Image2d, Mask2d};

/// 一组掩码的逐像素均值. 掩码集合为空时返回 `None`.
fn mean_of_masks(masks: &[Mask2d]) -> Option<Image2d> {
    let images: Vec<Image2d> = masks.iter().map(mask_to_image).collect();
    mean_stack(images.iter().map(|m| m.view())).ok()
}

/// 切片在分组配准空间中的数据.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registered {
    /// 配准后的强度图像. 归一化后被原地替换.
    pub im: Image2d,

    /// 配准后的白质掩码, 与 [`Slice::wm_seg`] 一一对应.
    pub wm_seg: Vec<Mask2d>,

    /// 配准后的灰质掩码, 与 [`Slice::gm_seg`] 一一对应.
    pub gm_seg: Vec<Mask2d>,

    /// `im` 是否已经过强度归一化.
    pub normalized: bool,
}

impl Registered {
    /// 像素网格形状.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.im.dim()
    }

    /// 配准后白质掩码的均值图像.
    #[inline]
    pub fn mean_wm(&self) -> Option<Image2d> {
        mean_of_masks(&self.wm_seg)
    }

    /// 配准后灰质掩码的均值图像.
    #[inline]
    pub fn mean_gm(&self) -> Option<Image2d> {
        mean_of_masks(&self.gm_seg)
    }
}

/// 某个受试者的一张水平切片, 以及它在流水线中逐步得到的数据.
///
/// `id` 在整个字典中唯一, 同时也是该切片在字典中的下标.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    id: usize,
    subject: String,
    z_index: usize,
    level: f64,
    im: Image2d,
    wm_seg: Vec<Mask2d>,
    gm_seg: Vec<Mask2d>,
    registered: Option<Registered>,
}

impl Slice {
    /// 创建新切片. 所有掩码必须与 `im` 形状一致, 且至少有一个白质掩码.
    pub fn new(
        id: usize,
        subject: impl Into<String>,
        z_index: usize,
        level: f64,
        im: Image2d,
        wm_seg: Vec<Mask2d>,
        gm_seg: Vec<Mask2d>,
    ) -> Self {
        debug_assert!(!wm_seg.is_empty());
        debug_assert!(wm_seg.iter().chain(gm_seg.iter()).all(|m| m.dim() == im.dim()));
        Self {
            id,
            subject: subject.into(),
            z_index,
            level,
            im,
            wm_seg,
            gm_seg,
            registered: None,
        }
    }

    /// 字典内唯一 id.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// 将 id 整体偏移 `offset`. 用于拼接多个受试者的切片.
    #[inline]
    pub fn offset_id(&mut self, offset: usize) {
        self.id += offset;
    }

    /// 来源受试者.
    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// 在来源体数据中的水平切片序号.
    #[inline]
    pub fn z_index(&self) -> usize {
        self.z_index
    }

    /// 椎体水平 (实数).
    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// 四舍五入后的椎体水平, 用于分组.
    #[inline]
    pub fn level_bucket(&self) -> i32 {
        self.level.round() as i32
    }

    /// 原始 (未配准) 强度图像.
    #[inline]
    pub fn im(&self) -> &Image2d {
        &self.im
    }

    /// 像素网格形状.
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.im.dim()
    }

    /// 原始白质掩码.
    #[inline]
    pub fn wm_seg(&self) -> &[Mask2d] {
        &self.wm_seg
    }

    /// 原始灰质掩码. 可能为空.
    #[inline]
    pub fn gm_seg(&self) -> &[Mask2d] {
        &self.gm_seg
    }

    /// 白质掩码的均值图像.
    pub fn mean_wm(&self) -> Result<Image2d> {
        let images: Vec<Image2d> = self.wm_seg.iter().map(mask_to_image).collect();
        mean_stack(images.iter().map(|m| m.view()))
    }

    /// 配准空间中的数据. 分组配准完成前为 `None`.
    #[inline]
    pub fn registered(&self) -> Option<&Registered> {
        self.registered.as_ref()
    }

    /// 配准空间中的可变数据.
    #[inline]
    pub fn registered_mut(&mut self) -> Option<&mut Registered> {
        self.registered.as_mut()
    }

    /// 写入配准结果, 覆盖之前的结果.
    #[inline]
    pub fn set_registered(&mut self, registered: Registered) {
        self.registered = Some(registered);
    }

    /// 配准后 (归一化后, 如果做过) 的强度图像.
    #[inline]
    pub fn registered_im(&self) -> Option<&Image2d> {
        self.registered.as_ref().map(|r| &r.im)
    }
}
