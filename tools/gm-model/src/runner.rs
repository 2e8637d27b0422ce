//! 程序运行函数.

use crate::result::BuildReport;
use gm_atlas::{AtlasConfig, AtlasError, Result, Todo};
use std::time::Instant;

/// 实际运行.
pub fn run(mut cfg: AtlasConfig) -> Result<BuildReport> {
    if cfg.run.workers == 0 {
        cfg.run.workers = utils::cpus();
    }
    let dir = match cfg.model.todo {
        Todo::Compute => {
            // 短路判断
            if !cfg.model.path_data.is_dir() {
                return Err(AtlasError::Config(format!(
                    "切片字典目录 {} 不存在",
                    cfg.model.path_data.display()
                )));
            }
            println!(
                "Building model from {} with {} workers...",
                cfg.model.path_data.display(),
                cfg.run.workers
            );
            cfg.model.new_model_dir.clone()
        }
        Todo::Load => {
            println!("Loading model from {}...", cfg.model.path_model_to_load.display());
            cfg.model.path_model_to_load.clone()
        }
    };

    let start = Instant::now();
    let model = gm_atlas::run(&cfg)?;
    Ok(BuildReport::new(cfg.model.todo, dir, &model, start.elapsed()))
}
