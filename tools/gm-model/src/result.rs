//! 运行结果.

use gm_atlas::{LevelIntensity, Model, ModelSummary, Todo};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

/// 将强度表写进 `w` 中.
fn describe_levels_into<W: Write>(levels: &[(i32, LevelIntensity)], w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    writeln!(w, "Intensity table:")?;
    if levels.is_empty() {
        return write!(w, "{S4}/");
    }
    for (i, (level, e)) in levels.iter().enumerate() {
        write!(
            w,
            "{S4}level {level:>3}: gm {:>10.3}, wm {:>10.3}, range [{:.3}, {:.3}]",
            e.gm, e.wm, e.min, e.max
        )?;
        if i + 1 < levels.len() {
            writeln!(w)?;
        }
    }
    Ok(())
}

/// 一次构建/加载的结果.
pub struct BuildReport {
    todo: Todo,
    dir: PathBuf,
    summary: ModelSummary,
    levels: Vec<(i32, LevelIntensity)>,
    elapsed: Duration,
}

impl BuildReport {
    pub fn new(todo: Todo, dir: PathBuf, model: &Model, elapsed: Duration) -> Self {
        Self {
            todo,
            dir,
            summary: model.summary(),
            levels: model.intensities().iter().map(|(l, e)| (l, *e)).collect(),
            elapsed,
        }
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        utils::sep();
        let verb = match self.todo {
            Todo::Compute => "Built",
            Todo::Load => "Loaded",
        };
        println!(
            "{verb} {} in {:.3} s",
            self.dir.display(),
            self.elapsed.as_secs_f64()
        );
        utils::sep();
        print!("{}", self.summary);
        utils::sep();

        let mut buf = Vec::with_capacity(512);
        match describe_levels_into(&self.levels, &mut buf) {
            Ok(()) => println!("{}", String::from_utf8_lossy(&buf)),
            Err(e) => eprintln!("{e}"),
        }
        utils::sep();
    }
}
