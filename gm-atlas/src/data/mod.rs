//! 体数据与切片数据结构.

use std::ops::Index;
use std::path::Path;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Ix2};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::error::{AtlasError, Result};
use crate::{Idx2d, Idx3d, Image2d};

pub mod image;
pub mod level;
pub mod plane;
pub mod slice;
pub mod window;

pub use image::Interp;
pub use level::{LevelSource, ParseLevelError};
pub use plane::Plane;
pub use slice::{Registered, Slice};
pub use window::IntensityWindow;

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    let [_, w, h, z, ..] = h.dim;
    (z.max(1) as usize, h as usize, w as usize)
}

/// 构造只带有体素分辨率的 header. `pix_dim` 按 `[z, H, W]` 给出.
fn header_with_pix_dim([z, h, w]: [f64; 3]) -> BoxedHeader {
    let mut header = Box::<NiftiHeader>::default();
    let [_, pw, ph, pz, ..] = &mut header.pixdim;
    (*pw, *ph, *pz) = (w as f32, h as f32, z as f32);
    header
}

/// 3D nii 文件 header 的共用属性.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小 `(z, H, W)`.
    fn shape(&self) -> Idx3d;

    /// 获取数据水平切片形状大小.
    #[inline]
    fn slice_shape(&self) -> Idx2d {
        let (_, h, w) = self.shape();
        (h, w)
    }

    /// 获取水平切片个数.
    #[inline]
    fn len_z(&self) -> usize {
        self.shape().0
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, w, h, z, ..] = self.header().pixdim;
        [z as f64, h as f64, w as f64]
    }

    /// 获取 width 方向体素分辨率, 以毫米为单位.
    #[inline]
    fn width_mm(&self) -> f64 {
        self.header().pixdim[1] as f64
    }

    /// 获取 height 方向体素分辨率, 以毫米为单位.
    #[inline]
    fn height_mm(&self) -> f64 {
        self.header().pixdim[2] as f64
    }

    /// 获取空间方向体素分辨率, 以毫米为单位.
    #[inline]
    fn z_mm(&self) -> f64 {
        self.header().pixdim[3] as f64
    }

    /// 水平切片的像素分辨率在两个方向上是否一致?
    #[inline]
    fn is_slice_isotropic(&self) -> bool {
        self.height_mm() == self.width_mm()
    }
}

macro_rules! impl_volume {
    ($name: ident, $elem: ty) => {
        impl NiftiHeaderAttr for $name {
            #[inline]
            fn header(&self) -> &NiftiHeader {
                &self.header
            }

            #[inline]
            fn shape(&self) -> Idx3d {
                self.data.dim()
            }
        }

        impl Index<Idx3d> for $name {
            type Output = $elem;

            #[inline]
            fn index(&self, index: Idx3d) -> &Self::Output {
                &self.data[index]
            }
        }

        impl $name {
            /// 打开 nii 文件. `path` 为 nii 文件的本地路径.
            pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
                let path = path.as_ref();
                let obj = ReaderOptions::new()
                    .read_file(path)
                    .map_err(|e| AtlasError::nifti(path, e))?;
                let header = Box::new(obj.header().clone());

                // [W, H, z] -> [z, H, W].
                // hint: 原第一维向下增长, 原第二维向右增长.
                let data = obj
                    .into_volume()
                    .into_ndarray::<$elem>()
                    .map_err(|e| AtlasError::nifti(path, e))?;
                let data = match data.ndim() {
                    2 => data.insert_axis(Axis(2)),
                    _ => data,
                };
                let data = data
                    .into_dimensionality::<ndarray::Ix3>()
                    .map_err(|e| AtlasError::InputData {
                        subject: path.display().to_string(),
                        reason: format!("不是三维体数据: {e}"),
                    })?
                    .permuted_axes([2, 1, 0]);
                let data = data.as_standard_layout().into_owned();
                debug_assert_eq!(data.dim(), get_shape_from_header(&header));

                Ok(Self { header, data })
            }

            /// 由 `(z, H, W)` 组织的裸数据直接创建. `pix_dim` 按 `[z, H, W]` 给出.
            pub fn from_raw(data: Array3<$elem>, pix_dim: [f64; 3]) -> Self {
                Self {
                    header: header_with_pix_dim(pix_dim),
                    data,
                }
            }

            /// 写出为 nii 文件, 保留原 header 中的空间信息.
            pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
                let path = path.as_ref();
                WriterOptions::new(path)
                    .reference_header(&self.header)
                    .write_nifti(&self.data.view().permuted_axes([2, 1, 0]))
                    .map_err(|e| AtlasError::nifti(path, e))
            }

            /// 获取 `plane` 平面上第 `index` 个切片视图.
            ///
            /// 当 `index` 越界时 panic.
            #[inline]
            pub fn slice_in(&self, plane: Plane, index: usize) -> ArrayView2<'_, $elem> {
                plane.slice_at(self.data.view(), index)
            }

            /// 获取水平面上第 `z_index` 个切片视图.
            #[inline]
            pub fn slice_at(&self, z_index: usize) -> ArrayView2<'_, $elem> {
                self.slice_in(Plane::Axial, z_index)
            }

            /// 获得数据的一份不可变 shallow copy.
            #[inline]
            pub fn data(&self) -> ArrayView3<'_, $elem> {
                self.data.view()
            }
        }
    };
}

/// nii 格式 3D MRI 扫描. 强度值以 `f32` 保存.
#[derive(Debug, Clone)]
pub struct ScanVolume {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl_volume!(ScanVolume, f32);

/// nii 格式 3D 标签图像 (分割掩码或椎体水平). 标签值以 `u8` 保存.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    header: BoxedHeader,
    data: Array3<u8>,
}

impl_volume!(LabelVolume, u8);

/// 将 `(H, W)` 组织的二维图像写出为 nii 文件. `pixel_mm` 按 `(H, W)` 给出.
pub fn write_image2d<P: AsRef<Path>>(path: P, im: &ArrayView2<f64>, pixel_mm: (f64, f64)) -> Result<()> {
    let path = path.as_ref();
    let header = header_with_pix_dim([1.0, pixel_mm.0, pixel_mm.1]);
    // nii 按 [W, H] 存储.
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&im.t())
        .map_err(|e| AtlasError::nifti(path, e))
}

/// 读取二维 nii 图像, 按 `(H, W)` 返回. 多余的长度为 1 的维度会被去掉.
pub fn read_image2d<P: AsRef<Path>>(path: P) -> Result<Image2d> {
    let path = path.as_ref();
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| AtlasError::nifti(path, e))?;
    let mut data = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| AtlasError::nifti(path, e))?;
    while data.ndim() > 2 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let data: Array2<f64> = data.into_dimensionality::<Ix2>().map_err(|e| {
        AtlasError::Registration(format!("{} 不是二维图像: {e}", path.display()))
    })?;
    Ok(data.reversed_axes().as_standard_layout().into_owned())
}
