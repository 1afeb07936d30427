// OutputManager mapping `OutputManager.cs`.
// Drives a running process future while its output lines are handed, one at a
// time and in arrival order, to a single consumer.

use agent_sdk::ProcessDataReceivedEventArgs;
use anyhow::Result;
use std::future::Future;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// How a pumped process ended from the step's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Exited(i32),
    /// The force-completed signal won the race. The child is left running.
    ForceCompleted,
}

impl ExecOutcome {
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ExecOutcome::Exited(code) => Some(code),
            ExecOutcome::ForceCompleted => None,
        }
    }
}

/// Run `exec` to completion while feeding every line from `receiver` to `on_line`.
///
/// Lines are consumed on the calling task, so `on_line` never runs concurrently
/// with itself. When `force_completed` fires first the exec future is dropped
/// without waiting for the child.
pub async fn pump_output<Fut, F>(
    exec: Fut,
    mut receiver: UnboundedReceiver<ProcessDataReceivedEventArgs>,
    force_completed: Option<CancellationToken>,
    mut on_line: F,
) -> Result<ExecOutcome>
where
    Fut: Future<Output = Result<i32>>,
    F: FnMut(ProcessDataReceivedEventArgs),
{
    tokio::pin!(exec);
    let force_completed = force_completed.unwrap_or_default();
    let mut stream_open = true;

    loop {
        tokio::select! {
            biased;

            line = receiver.recv(), if stream_open => match line {
                Some(line) => on_line(line),
                None => stream_open = false,
            },
            result = &mut exec => {
                // The gateway joins its readers before returning, so whatever is
                // left is already queued.
                while let Ok(line) = receiver.try_recv() {
                    on_line(line);
                }
                return result.map(ExecOutcome::Exited);
            }
            _ = force_completed.cancelled() => {
                while let Ok(line) = receiver.try_recv() {
                    on_line(line);
                }
                return Ok(ExecOutcome::ForceCompleted);
            }
        }
    }
}
