//! 构建或加载灰质/白质统计模型.
//!
//! 用法: `gm-model [config.toml]`. 不给出配置文件时, 依次尝试 `$GM_ATLAS_CONFIG`
//! 与 `$HOME/dataset/gm_atlas.toml`, 都不存在时使用默认配置.

mod result;
mod runner;

use std::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let path = std::env::args_os().nth(1);
    let cfg = match utils::loader::load_config(path.as_ref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(cfg.run.log_level())
        .init()
    {
        eprintln!("Logger init error: {e}");
    }

    utils::sep();
    print!("{cfg}");
    match runner::run(cfg) {
        Ok(report) => {
            report.analyze();
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            let mut source = e.source();
            while let Some(s) = source {
                log::error!("    caused by: {s}");
                source = s.source();
            }
            ExitCode::FAILURE
        }
    }
}
