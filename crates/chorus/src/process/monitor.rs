//! Output monitor — one long-lived task per tracked process.
//!
//! Reads stdout and stderr line-by-line, appends to the per-pid log files,
//! maintains the rolling tail, feeds the hook dispatcher, and finalizes
//! the process row on exit.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::process::TrackedProcess;
use crate::process::manager::ProcessManager;

pub(crate) async fn run_monitor(
    mut child: tokio::process::Child,
    tracked: Arc<TrackedProcess>,
    manager: Arc<ProcessManager>,
) {
    let pid = tracked.pid;

    if let Some(parent) = tracked.stdout_log.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        tracing::warn!(pid, error = %e, "failed to create process log dir");
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = stdout.map(|pipe| {
        tokio::spawn(read_stream(
            pipe,
            "stdout",
            tracked.clone(),
            manager.clone(),
            tracked.stdout_log.clone(),
        ))
    });
    let stderr_task = stderr.map(|pipe| {
        tokio::spawn(read_stream(
            pipe,
            "stderr",
            tracked.clone(),
            manager.clone(),
            tracked.stderr_log.clone(),
        ))
    });

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to reap process");
            None
        }
    };

    manager.finalize_exit(pid, exit_code).await;
}

async fn read_stream<R>(
    pipe: R,
    stream_name: &'static str,
    tracked: Arc<TrackedProcess>,
    manager: Arc<ProcessManager>,
    log_path: std::path::PathBuf,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let pid = tracked.pid;
    let mut log_file = match tokio::fs::File::create(&log_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(pid, error = %e, path = %log_path.display(), "failed to open process log");
            None
        }
    };

    let mut lines = BufReader::new(pipe).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid, stream = stream_name, error = %e, "stream read ended");
                break;
            }
        };

        if let Some(file) = log_file.as_mut() {
            if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                tracing::warn!(pid, error = %e, "failed to append process log");
                log_file = None;
            } else {
                let _ = file.flush().await;
            }
        }

        let tail_line = if stream_name == "stderr" {
            format!("err: {line}")
        } else {
            line.clone()
        };
        tracked.push_tail_line(tail_line);

        manager.dispatch_line(pid, stream_name, &line).await;
    }
}
