// ProcessInvoker mapping `ProcessInvoker.cs`.
// Launches a child process, streams its stdout/stderr lines into a caller-owned
// channel, optionally feeds stdin, and escalates signals on cancellation.

use crate::trace::TraceWriter;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, thiserror::Error)]
#[error(
    "Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'."
)]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

#[derive(Debug, thiserror::Error)]
#[error("The operation was canceled. Process '{file_name}' exited with code {exit_code}.")]
pub struct ProcessCancelledError {
    pub file_name: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line read from the child, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDataReceivedEventArgs {
    pub stream: OutputStream,
    pub data: String,
}

/// Text decoding applied to the child's output bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEncoding {
    Utf8,
    /// Each byte is one code point. Matches legacy single-byte console code pages closely enough for logs.
    Latin1,
}

impl OutputEncoding {
    fn decode(self, bytes: &[u8]) -> String {
        match self {
            OutputEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            OutputEncoding::Latin1 => bytes.iter().map(|b| *b as char).collect(),
        }
    }
}

/// Knobs for a single `execute` call.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub require_exit_code_zero: bool,
    /// `None` lets the agent pick its platform default (lossy UTF-8).
    pub output_encoding: Option<OutputEncoding>,
    /// Skip the SIGINT/SIGTERM grace period and kill straight away.
    pub kill_process_on_cancel: bool,
    /// Lines written to the child's stdin, which is then closed. `None` attaches null stdin.
    pub standard_input: Option<Vec<String>>,
    /// Keep the child in the agent's process group so console signals reach it too.
    pub inherit_console_handler: bool,
}

pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }

    /// Run `file_name` to completion, sending every output line into `output`.
    ///
    /// The sender is moved into the reader tasks, so the receiving side observes
    /// the end of the stream once both pipes are drained. Returns the exit code;
    /// a non-zero code is an error only when `require_exit_code_zero` is set.
    pub async fn execute(
        &self,
        working_directory: &str,
        file_name: &str,
        arguments: &str,
        environment: Option<&HashMap<String, String>>,
        options: &ProcessOptions,
        output: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        if file_name.is_empty() {
            bail!("Value cannot be null or empty. (Parameter 'fileName')");
        }

        self.trace.info("Starting process:");
        self.trace.info(&format!("  File name: '{file_name}'"));
        self.trace.info(&format!("  Arguments: '{arguments}'"));
        self.trace
            .info(&format!("  Working directory: '{working_directory}'"));
        self.trace.info(&format!(
            "  Require exit code zero: '{}'",
            options.require_exit_code_zero
        ));
        self.trace.info(&format!(
            "  Encoding: '{}'",
            options
                .output_encoding
                .map(|e| format!("{e:?}"))
                .unwrap_or_else(|| "Default".to_string())
        ));
        self.trace.info(&format!(
            "  Force kill process on cancellation: '{}'",
            options.kill_process_on_cancel
        ));
        self.trace.info(&format!(
            "  Redirected STDIN: '{}'",
            options.standard_input.is_some()
        ));
        self.trace.info(&format!(
            "  Persist current code page: '{}'",
            options.inherit_console_handler
        ));

        let mut cmd = Command::new(file_name);
        apply_arguments(&mut cmd, arguments);

        if !working_directory.is_empty() && Path::new(working_directory).is_dir() {
            cmd.current_dir(working_directory);
        }

        if let Some(env) = environment {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }
        if environment.map_or(true, |e| !e.keys().any(|k| k.eq_ignore_ascii_case("TF_BUILD"))) {
            cmd.env("TF_BUILD", "True");
        }

        #[cfg(unix)]
        if !options.inherit_console_handler {
            cmd.process_group(0);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if options.standard_input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to start process '{file_name}' with arguments '{arguments}'")
        })?;

        let pid = child.id().unwrap_or(0);
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        if let (Some(lines), Some(mut stdin)) = (options.standard_input.clone(), child.stdin.take())
        {
            let trace = self.trace.clone();
            tokio::spawn(async move {
                for line in lines {
                    let write = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await
                    };
                    if let Err(e) = write.await {
                        trace.info(&format!("Failed to write STDIN: {e}"));
                        return;
                    }
                }
                let _ = stdin.shutdown().await;
                trace.info("STDIN stream write finished.");
            });
        }

        let encoding = options.output_encoding.unwrap_or(OutputEncoding::Utf8);
        let stdout_task = child.stdout.take().map(|pipe| {
            spawn_reader(pipe, OutputStream::Stdout, encoding, output.clone(), self.trace.clone())
        });
        let stderr_task = child.stderr.take().map(|pipe| {
            spawn_reader(pipe, OutputStream::Stderr, encoding, output.clone(), self.trace.clone())
        });
        drop(output);

        let (exit_code, was_cancelled) = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                (status.code().unwrap_or(-1), false)
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                let code = self
                    .cancel_and_kill_process(&mut child, options.kill_process_on_cancel, !options.inherit_console_handler)
                    .await;
                (code, true)
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            return Err(ProcessCancelledError {
                file_name: file_name.to_string(),
                exit_code,
            }
            .into());
        }

        if exit_code != 0 && options.require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: file_name.to_string(),
                arguments: arguments.to_string(),
            }
            .into());
        }

        Ok(exit_code)
    }

    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
        own_group: bool,
    ) -> i32 {
        if !kill_immediately {
            if self
                .send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT, own_group)
                .await
            {
                self.trace.info("Process cancelled successfully through SIGINT.");
                return wait_code(child).await;
            }

            if self
                .send_signal_and_wait(child, Signal::Term, SIGTERM_TIMEOUT, own_group)
                .await
            {
                self.trace.info("Process terminated successfully through SIGTERM.");
                return wait_code(child).await;
            }
        }

        self.trace.info(
            "Kill entire process tree since both cancel and terminate signals have been ignored.",
        );
        #[cfg(unix)]
        if own_group {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        let _ = child.kill().await;
        wait_code(child).await
    }

    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
        own_group: bool,
    ) -> bool {
        let Some(pid) = child.id() else {
            return true;
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };
        self.trace.info(&format!("Sending {sig:?} to process {pid}."));

        let target = nix::unistd::Pid::from_raw(pid as i32);
        let sent = if own_group {
            nix::sys::signal::killpg(target, sig)
        } else {
            nix::sys::signal::kill(target, sig)
        };
        if sent.is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
        _own_group: bool,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

async fn wait_code(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

fn spawn_reader<R>(
    pipe: R,
    stream: OutputStream,
    encoding: OutputEncoding,
    output: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    trace: Arc<dyn TraceWriter>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                        buf.pop();
                    }
                    let data = encoding.decode(&buf);
                    // The receiver may have stopped listening; keep draining the pipe anyway.
                    let _ = output.send(ProcessDataReceivedEventArgs { stream, data });
                }
                Err(e) => {
                    trace.info(&format!("{stream:?} read failed: {e}"));
                    break;
                }
            }
        }
        trace.info(&format!("{stream:?} stream read finished."));
    })
}

#[cfg(windows)]
fn apply_arguments(cmd: &mut Command, arguments: &str) {
    if !arguments.is_empty() {
        cmd.raw_arg(arguments);
    }
}

#[cfg(not(windows))]
fn apply_arguments(cmd: &mut Command, arguments: &str) {
    for arg in shell_split(arguments) {
        cmd.arg(arg);
    }
}

/// Splits an argument string the way a POSIX shell would for plain words,
/// single quotes, double quotes and backslash escapes.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' if !in_single => {
                if let Some(&next) = chars.peek() {
                    // Inside double quotes only a few characters are escapable.
                    if !in_double || matches!(next, '"' | '\\' | '$' | '`') {
                        current.push(next);
                        chars.next();
                    } else {
                        current.push('\\');
                    }
                    has_token = true;
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CollectingTraceWriter, NullTraceWriter};

    fn invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter))
    }

    async fn drain(
        mut rx: mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>,
    ) -> Vec<ProcessDataReceivedEventArgs> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn shell_split_words_and_quotes() {
        assert_eq!(shell_split("hello world"), vec!["hello", "world"]);
        assert_eq!(
            shell_split(r#"-c "echo hi && env" tail"#),
            vec!["-c", "echo hi && env", "tail"]
        );
        assert_eq!(shell_split("a 'b c' d"), vec!["a", "b c", "d"]);
        assert!(shell_split("   ").is_empty());
    }

    #[test]
    fn shell_split_escapes() {
        assert_eq!(
            shell_split(r#""/tmp/my \"quoted\" dir/index.js""#),
            vec![r#"/tmp/my "quoted" dir/index.js"#]
        );
        assert_eq!(shell_split(r#"a\ b"#), vec!["a b"]);
        assert_eq!(shell_split(r#""""#), vec![""]);
    }

    #[test]
    fn latin1_maps_bytes_to_code_points() {
        assert_eq!(OutputEncoding::Latin1.decode(&[0x63, 0x61, 0x66, 0xe9]), "café");
        assert_eq!(OutputEncoding::Utf8.decode("café".as_bytes()), "café");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_are_tagged() {
        let (tx, rx) = mpsc::unbounded_channel();
        let code = invoker()
            .execute(
                "",
                "sh",
                r#"-c "echo out; echo err 1>&2""#,
                None,
                &ProcessOptions::default(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);

        let lines = drain(rx).await;
        assert!(lines.contains(&ProcessDataReceivedEventArgs {
            stream: OutputStream::Stdout,
            data: "out".to_string()
        }));
        assert!(lines.contains(&ProcessDataReceivedEventArgs {
            stream: OutputStream::Stderr,
            data: "err".to_string()
        }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdin_lines_are_delivered() {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ProcessOptions {
            standard_input: Some(vec!["first".to_string(), "second".to_string()]),
            ..Default::default()
        };
        invoker()
            .execute("", "cat", "", None, &options, tx, CancellationToken::new())
            .await
            .unwrap();

        let data: Vec<String> = drain(rx).await.into_iter().map(|l| l.data).collect();
        assert_eq!(data, vec!["first", "second"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("STEP_VALUE".to_string(), "abc 123".to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        invoker()
            .execute(
                &dir.path().to_string_lossy(),
                "sh",
                r#"-c "echo $STEP_VALUE; echo $TF_BUILD; pwd""#,
                Some(&env),
                &ProcessOptions::default(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let data: Vec<String> = drain(rx).await.into_iter().map(|l| l.data).collect();
        assert_eq!(data[0], "abc 123");
        assert_eq!(data[1], "True");
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(std::fs::canonicalize(&data[2]).unwrap(), cwd);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let code = invoker()
            .execute("", "sh", r#"-c "exit 3""#, None, &ProcessOptions::default(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 3);

        let (tx, _rx) = mpsc::unbounded_channel();
        let options = ProcessOptions {
            require_exit_code_zero: true,
            ..Default::default()
        };
        let err = invoker()
            .execute("", "sh", r#"-c "exit 3""#, None, &options, tx, CancellationToken::new())
            .await
            .unwrap_err();
        let exit = err.downcast_ref::<ProcessExitCodeError>().unwrap();
        assert_eq!(exit.exit_code, 3);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let trace = Arc::new(CollectingTraceWriter::new());
        let err = ProcessInvoker::new(trace.clone())
            .execute(
                "",
                "no_such_binary_9f2c",
                "",
                None,
                &ProcessOptions::default(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to start process"));
        assert!(trace.contains(crate::trace::TraceLevel::Info, "no_such_binary_9f2c"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let options = ProcessOptions {
            kill_process_on_cancel: true,
            ..Default::default()
        };

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = invoker()
            .execute("", "sleep", "30", None, &options, tx, token)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ProcessCancelledError>().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
