//! The four stage operations
//!
//! Each one reads the artifact of the previous stage, writes its own, and
//! returns early when its artifact already exists.

pub mod metadata;
pub mod organize;
pub mod package;
pub mod split;

pub use metadata::{MetadataStage, TrackMetadata};
pub use organize::OrganizeStage;
pub use package::PackageStage;
pub use split::{CommandSeparator, SeparatorModel, SplitStage, StemSeparator};

use std::path::Path;
use std::process::Stdio;

use crate::error::{StageError, StageResult};

/// Run blocking file or codec work off the async runtime
pub(crate) async fn blocking<T, F>(f: F) -> StageResult<T>
where
    F: FnOnce() -> StageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StageError::Transient(format!("Worker task failed: {}", e)))?
}

/// Substitute `{name}` placeholders in each argument
pub(crate) fn render_command(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (name, value)| acc.replace(&format!("{{{}}}", name), value))
        })
        .collect()
}

/// Run an external tool; a non-zero exit becomes `StageError::External`
pub(crate) async fn run_tool(command: &[String], cwd: Option<&Path>) -> StageResult<()> {
    let Some((program, args)) = command.split_first() else {
        return Err(StageError::Transient("Empty command".to_string()));
    };

    tracing::debug!(program = %program, ?args, "Running external tool");

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|e| StageError::External {
        tool: program.clone(),
        status: "not started".to_string(),
        stderr: e.to_string(),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Keep the tail; separators print long progress logs
        let tail: String = stderr
            .lines()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(StageError::External {
            tool: program.clone(),
            status: output.status.to_string(),
            stderr: tail,
        });
    }
    Ok(())
}

/// Write `bytes` next to `path` and rename into place, so readers never see
/// a half-written artifact
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("partial");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
