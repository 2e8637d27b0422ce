use std::path::Path;

use ndarray::ArrayView2;

use super::image::min_max;
use crate::error::{AtlasError, Result};

/// 强度窗口, 包含窗位 (window level) 和窗宽 (window width).
///
/// 该窗口是只读的. 若要修改窗口参数, 你应该创建新的实例.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IntensityWindow {
    level: f64,
    width: f64,
}

impl IntensityWindow {
    /// 构建强度窗.
    ///
    /// `level` 必须有限, `width` 必须为有限正数, 否则返回 `None`.
    pub fn new(level: f64, width: f64) -> Option<IntensityWindow> {
        if level.is_finite() && width.is_finite() && width > 0.0 {
            Some(Self { level, width })
        } else {
            None
        }
    }

    /// 构建恰好覆盖 `[lo, hi]` 的窗口. 当 `lo == hi` 时窗宽取 1.
    ///
    /// 如果 `lo > hi` 或者任意一端无意义, 则返回 `None`.
    pub fn from_bounds(lo: f64, hi: f64) -> Option<IntensityWindow> {
        if !(lo.is_finite() && hi.is_finite()) || lo > hi {
            return None;
        }
        let width = if hi > lo { hi - lo } else { 1.0 };
        Self::new(lo + width / 2.0, width)
    }

    /// 覆盖 `im` 全部强度的窗口. 图像为空或含无意义值时返回 `None`.
    #[inline]
    pub fn covering(im: &ArrayView2<f64>) -> Option<IntensityWindow> {
        min_max(im).and_then(|(lo, hi)| Self::from_bounds(lo, hi))
    }

    /// 窗下限.
    #[inline]
    pub fn lower_bound(&self) -> f64 {
        self.level - self.width / 2.0
    }

    /// 窗上限.
    #[inline]
    pub fn upper_bound(&self) -> f64 {
        self.level + self.width / 2.0
    }

    /// 窗位.
    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// 窗宽.
    #[inline]
    pub fn width(&self) -> f64 {
        self.width
    }

    /// 求在当前窗设置下, 强度 `v` 对应的灰度图像素整数值 (0 <= value <= 255)
    ///
    /// 如果 `v` 无意义 (如 inf, NaN), 则返回 `None`.
    pub fn eval(&self, v: f64) -> Option<u8> {
        if !v.is_finite() {
            return None;
        }
        let lb = self.lower_bound();
        if v <= lb {
            Some(u8::MIN)
        } else if v >= self.upper_bound() {
            Some(u8::MAX)
        } else {
            // 255, not 256.
            Some((((v - lb) / self.width()) * 255.0) as u8)
        }
    }

    /// 按当前窗口将 `im` 保存为 8 位灰度图. 无意义像素保存为黑色.
    pub fn save_gray<P: AsRef<Path>>(&self, im: &ArrayView2<f64>, path: P) -> Result<()> {
        let path = path.as_ref();
        let (height, width) = im.dim();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in im.indexed_iter() {
            let v = self.eval(pix).unwrap_or(u8::MIN);
            buf.put_pixel(w as u32, h as u32, image::Luma([v]));
        }
        buf.save(path).map_err(|source| AtlasError::Image {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_window_invalid_input() {
        assert!(IntensityWindow::new(0.0, -1.0).is_none());
        assert!(IntensityWindow::new(0.0, 0.0).is_none());
        assert!(IntensityWindow::new(f64::NAN, 1.0).is_none());
        assert!(IntensityWindow::from_bounds(2.0, 1.0).is_none());
    }

    #[test]
    fn test_window_generic() {
        // [60, 100]
        let win = IntensityWindow::from_bounds(60.0, 100.0).unwrap();
        assert_eq!(win.level(), 80.0);
        assert_eq!(win.width(), 40.0);
        assert_eq!(win.eval(f64::NAN), None);
        assert_eq!(win.eval(f64::MIN), Some(0));
        assert_eq!(win.eval(f64::MAX), Some(255));
        assert_eq!(win.eval(60.0), Some(0));
        assert_eq!(win.eval(70.0).unwrap(), (255.0 * 0.25) as u8);
        assert_eq!(win.eval(99.999), Some(254));
        assert_eq!(win.eval(100.0), Some(255));
    }

    #[test]
    fn test_constant_image_window() {
        let im = array![[2.0, 2.0], [2.0, 2.0]];
        let win = IntensityWindow::covering(&im.view()).unwrap();
        assert_eq!(win.lower_bound(), 2.0);
        assert_eq!(win.eval(2.0), Some(0));
    }

    #[test]
    fn test_save_gray() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mean.png");
        let im = array![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]];
        let win = IntensityWindow::covering(&im.view()).unwrap();
        win.save_gray(&im.view(), &path).unwrap();

        let back = image::open(&path).unwrap().to_luma8();
        assert_eq!(back.dimensions(), (3, 2));
        assert_eq!(back.get_pixel(0, 0).0, [0]);
        assert_eq!(back.get_pixel(2, 1).0, [255]);
    }
}
