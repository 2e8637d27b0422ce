//! 外部配准程序封装.
//!
//! 配准: `<register> -i src.nii.gz -d dest.nii.gz -param <recipe> -ofolder <work_dir>`,
//! 程序需在 `work_dir` 中写出 `warp_src2dest.nii.gz` 与 `warp_dest2src.nii.gz`.
//!
//! 应用: `<apply> -i <src> -d <dest> -w <warp> -x nn|linear -o <out>`.
//!
//! 所有路径都是显式的, 不修改进程的当前工作目录.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use ndarray::ArrayView2;

use super::recipe::RegistrationRecipe;
use super::{Registrar, WarpPair};
use crate::consts::files::{WARP_DEST2SRC, WARP_SRC2DEST};
use crate::data::{read_image2d, write_image2d, Interp};
use crate::error::{AtlasError, Result};
use crate::Image2d;

/// 通过子进程调用外部程序的配准实现.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalRegistrar {
    register_program: PathBuf,
    apply_program: PathBuf,
    pixel_mm: f64,
}

impl ExternalRegistrar {
    /// 创建实例. `pixel_mm` 为写给外部程序的图像像素尺寸.
    pub fn new(register_program: impl Into<PathBuf>, apply_program: impl Into<PathBuf>, pixel_mm: f64) -> Self {
        Self {
            register_program: register_program.into(),
            apply_program: apply_program.into(),
            pixel_mm,
        }
    }

    fn write(&self, path: &Path, im: &ArrayView2<f64>) -> Result<()> {
        write_image2d(path, im, (self.pixel_mm, self.pixel_mm))
    }
}

/// 运行外部程序, 非零退出状态视为配准失败.
fn run<I, S>(program: &Path, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    debug!("Run {cmd:?}");
    let output = cmd.output().map_err(|e| AtlasError::io(program, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AtlasError::Registration(format!(
            "{} 以 {} 退出: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl Registrar for ExternalRegistrar {
    fn register(
        &self,
        src: &ArrayView2<f64>,
        dest: &ArrayView2<f64>,
        recipe: &RegistrationRecipe,
        work_dir: &Path,
    ) -> Result<WarpPair> {
        let src_path = work_dir.join("src.nii.gz");
        let dest_path = work_dir.join("dest.nii.gz");
        self.write(&src_path, src)?;
        self.write(&dest_path, dest)?;

        run(
            &self.register_program,
            [
                OsStr::new("-i"),
                src_path.as_os_str(),
                OsStr::new("-d"),
                dest_path.as_os_str(),
                OsStr::new("-param"),
                OsStr::new(&recipe.to_string()),
                OsStr::new("-ofolder"),
                work_dir.as_os_str(),
            ],
        )?;

        let pair = WarpPair {
            src2dest: work_dir.join(format!("{WARP_SRC2DEST}.nii.gz")),
            dest2src: work_dir.join(format!("{WARP_DEST2SRC}.nii.gz")),
        };
        for warp in [&pair.src2dest, &pair.dest2src] {
            if !warp.is_file() {
                return Err(AtlasError::Registration(format!(
                    "{} 没有生成形变场 {}",
                    self.register_program.display(),
                    warp.display()
                )));
            }
        }
        Ok(pair)
    }

    fn apply(
        &self,
        src: &ArrayView2<f64>,
        dest: &ArrayView2<f64>,
        warp: &Path,
        interp: Interp,
        work_dir: &Path,
    ) -> Result<Image2d> {
        let src_path = work_dir.join("apply_src.nii.gz");
        let dest_path = work_dir.join("apply_dest.nii.gz");
        let out_path = work_dir.join("apply_out.nii.gz");
        self.write(&src_path, src)?;
        self.write(&dest_path, dest)?;

        run(
            &self.apply_program,
            [
                OsStr::new("-i"),
                src_path.as_os_str(),
                OsStr::new("-d"),
                dest_path.as_os_str(),
                OsStr::new("-w"),
                warp.as_os_str(),
                OsStr::new("-x"),
                OsStr::new(interp.as_arg()),
                OsStr::new("-o"),
                out_path.as_os_str(),
            ],
        )?;

        let out = read_image2d(&out_path)?;
        if out.dim() != dest.dim() {
            return Err(AtlasError::ShapeMismatch {
                expected: dest.dim(),
                got: out.dim(),
                context: format!("{} 的输出", self.apply_program.display()),
            });
        }
        Ok(out)
    }
}
