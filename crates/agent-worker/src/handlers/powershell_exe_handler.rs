// PowerShellExeHandler mapping `PowerShellExeHandler.cs`.
// Runs a script file or inline script with `powershell.exe` directly. The user's
// expression never appears in plain text on the command line; a payload
// transport decides how it reaches the process.

use agent_common::{HandlerError, WellKnownDirectory};
use agent_sdk::{ArgUtil, IOUtil, OutputStream, ProcessOptions, StringUtil, TraceWriter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::{PayloadTransportKind, PowerShellExeHandlerData, ScriptType};
use crate::handlers::powershell3_handler::resolve_powershell_exe;

const POWERSHELL_COMMON_ARGUMENTS: &str =
    "-NoLogo -Sta -NoProfile -NonInteractive -ExecutionPolicy Unrestricted";

/// Propagates the script's `$LastExitCode` as the process exit code.
const EXIT_CODE_EPILOGUE: &str = "if (!(Test-Path -LiteralPath variable:\\LastExitCode)) { Write-Verbose 'Last exit code is not set.' } else { Write-Verbose ('$LastExitCode: {0}' -f $LastExitCode) ; exit $LastExitCode }";

/// How `powershell.exe` receives the wrapped expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPayload {
    pub arguments: String,
    pub standard_input: Option<Vec<String>>,
}

pub trait PayloadTransport: Send + Sync {
    fn prepare(&self, expression: &str) -> TransportPayload;
}

/// `-Command -` with the script streamed over stdin.
pub struct StdinPayloadTransport;

impl PayloadTransport for StdinPayloadTransport {
    fn prepare(&self, expression: &str) -> TransportPayload {
        TransportPayload {
            arguments: format!("{POWERSHELL_COMMON_ARGUMENTS} -Command -"),
            standard_input: Some(vec![expression.to_string(), EXIT_CODE_EPILOGUE.to_string()]),
        }
    }
}

/// `-EncodedCommand` with base64 UTF-16LE, for hosts that cannot read stdin.
pub struct EncodedCommandTransport;

impl EncodedCommandTransport {
    pub fn encode(script: &str) -> String {
        let bytes: Vec<u8> = script
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}

impl PayloadTransport for EncodedCommandTransport {
    fn prepare(&self, expression: &str) -> TransportPayload {
        let script = format!("{expression} ; {EXIT_CODE_EPILOGUE}");
        TransportPayload {
            arguments: format!(
                "{POWERSHELL_COMMON_ARGUMENTS} -EncodedCommand {}",
                Self::encode(&script)
            ),
            standard_input: None,
        }
    }
}

pub fn payload_transport(kind: PayloadTransportKind) -> Box<dyn PayloadTransport> {
    match kind {
        PayloadTransportKind::Stdin => Box::new(StdinPayloadTransport),
        PayloadTransportKind::EncodedCommand => Box::new(EncodedCommandTransport),
    }
}

/// Dot-source the script so it runs in the wrapper's scope.
pub fn nested_expression(script_file: &str, argument_format: &str) -> String {
    format!(
        ". '{}' {}",
        script_file.trim_matches('"').replace('\'', "''"),
        argument_format
    )
}

pub struct PowerShellExeHandler {
    base: HandlerBase,
    data: PowerShellExeHandlerData,
}

impl PowerShellExeHandler {
    pub fn new(base: HandlerBase, data: PowerShellExeHandlerData) -> Self {
        Self { base, data }
    }

    fn working_directory(&self, script_file: &str) -> PathBuf {
        if !self.data.working_directory.is_empty() {
            return PathBuf::from(&self.data.working_directory);
        }
        let script = Path::new(script_file.trim_matches('"'));
        match script.parent() {
            Some(parent) if script.is_absolute() && script.is_file() => parent.to_path_buf(),
            _ => self.base.task_directory.join("DefaultTaskWorkingDirectory"),
        }
    }

    fn write_inline_script(&self, context: &ExecutionContext) -> Result<PathBuf> {
        let temp_directory = context
            .variables()
            .agent_temp_directory()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.base.host_context().get_directory(WellKnownDirectory::Temp));
        IOUtil::ensure_directory(&temp_directory)?;
        let script_file = temp_directory.join(format!("{}.ps1", Uuid::new_v4()));
        self.base.trace.info(&format!(
            "Writing inline script to temp file: '{}'",
            script_file.display()
        ));
        std::fs::write(&script_file, &self.data.inline_script)
            .with_context(|| format!("Failed to write script file: {}", script_file.display()))?;
        Ok(script_file)
    }

    async fn run_script(
        &mut self,
        context: &mut ExecutionContext,
        script_file: &str,
        fail_on_standard_error: bool,
    ) -> Result<()> {
        let step_host = Arc::clone(&self.base.step_host);
        let expression = nested_expression(
            &step_host.resolve_path_for_step_host(script_file),
            &self.data.argument_format,
        );
        let payload = payload_transport(self.data.payload_transport).prepare(&expression);

        let working_directory = self.working_directory(script_file);
        context.debug(&format!("Working directory: '{}'", working_directory.display()));
        IOUtil::ensure_directory(&working_directory)?;

        let powershell = resolve_powershell_exe(step_host.as_ref())?;
        ArgUtil::not_null_or_empty(&powershell, "powershell").map_err(HandlerError::from)?;
        context.debug(&format!("{powershell} {}", payload.arguments));
        context.command(&expression);

        let options = ProcessOptions {
            require_exit_code_zero: false,
            kill_process_on_cancel: false,
            standard_input: payload.standard_input,
            inherit_console_handler: !context.variables().retain_default_encoding(),
            ..Default::default()
        };
        let request = self.base.exec_request(
            context,
            &working_directory.to_string_lossy(),
            &powershell,
            &payload.arguments,
            options,
        );

        // Consecutive stderr lines are reported as one error.
        let mut error_buffer: Vec<String> = Vec::new();
        let mut error_count = 0usize;
        let flush = |ctx: &mut ExecutionContext, buffer: &mut Vec<String>, count: &mut usize| {
            if !buffer.is_empty() {
                ctx.error(&buffer.join("\n"));
                *count += 1;
                buffer.clear();
            }
        };
        let commands = Arc::clone(&self.base.commands);
        let outcome = self
            .base
            .execute_with(context, &request, None, |ctx, line| match line.stream {
                OutputStream::Stderr if fail_on_standard_error => {
                    if !line.data.is_empty() {
                        error_buffer.push(line.data);
                    }
                }
                OutputStream::Stderr => ctx.output(&line.data),
                OutputStream::Stdout => {
                    flush(ctx, &mut error_buffer, &mut error_count);
                    commands.process_output_line(ctx, &line.data);
                }
            })
            .await?;
        flush(context, &mut error_buffer, &mut error_count);

        let exit_code = outcome.exit_code().unwrap_or_default();
        if fail_on_standard_error && error_count > 0 {
            if context.result().is_some() {
                self.base.trace.info(&format!(
                    "Task result already set. Not failing due to error count ({error_count})."
                ));
            } else {
                return Err(HandlerError::task(format!(
                    "Process completed with exit code {exit_code} and had {error_count} error(s) written to the error stream."
                ))
                .into());
            }
        }
        if exit_code != 0 {
            return Err(HandlerError::task(format!(
                "Process completed with exit code {exit_code}."
            ))
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for PowerShellExeHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        self.base.trace.entering("PowerShellExeHandler::run_async");
        ArgUtil::directory_exists(&self.base.task_directory, "TaskDirectory")
            .map_err(HandlerError::from)?;

        self.base.add_variables_to_environment(context, true, true)?;
        if let Some(token) = context
            .variables()
            .system_access_token()
            .filter(|t| !t.is_empty())
        {
            self.base
                .add_environment_variable("SYSTEM_ACCESSTOKEN", Some(&token));
        }

        let fail_on_standard_error =
            StringUtil::convert_to_bool_or(self.data.fail_on_standard_error.as_deref(), true);

        let inline_script = match self.data.script_type {
            ScriptType::InlineScript => Some(self.write_inline_script(context)?),
            ScriptType::FilePath => {
                ArgUtil::not_null_or_empty(&self.data.target, "Target")
                    .map_err(HandlerError::from)?;
                None
            }
        };
        let script_file = match &inline_script {
            Some(path) => path.to_string_lossy().into_owned(),
            None => self.data.target.clone(),
        };

        let result = self
            .run_script(context, &script_file, fail_on_standard_error)
            .await;

        if let Some(path) = inline_script.filter(|p| p.exists()) {
            if let Err(e) = IOUtil::delete_file(&path) {
                context.warning(&format!(
                    "Unable to delete script file '{}': {e:#}",
                    path.display()
                ));
            }
        }

        result.map(|()| HandlerOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::make_test_context;
    use crate::handlers::step_host::{RecordingStepHost, StepHost};
    use std::collections::{BTreeMap, HashMap};

    fn handler(
        ctx: &ExecutionContext,
        host: Arc<dyn StepHost>,
        dir: &Path,
        data: PowerShellExeHandlerData,
    ) -> PowerShellExeHandler {
        let base = HandlerBase::new(
            Arc::clone(ctx.host_context()),
            "PowerShellExeHandler",
            host,
            BTreeMap::new(),
            HashMap::new(),
            dir.to_path_buf(),
        );
        PowerShellExeHandler::new(base, data)
    }

    fn inline(script: &str) -> PowerShellExeHandlerData {
        PowerShellExeHandlerData {
            script_type: ScriptType::InlineScript,
            inline_script: script.into(),
            ..Default::default()
        }
    }

    #[test]
    fn expression_dot_sources_the_script() {
        assert_eq!(
            nested_expression("\"C:\\it's\\run.ps1\"", "-Verbose"),
            ". 'C:\\it''s\\run.ps1' -Verbose"
        );
    }

    #[test]
    fn transports_keep_the_expression_off_the_command_line() {
        let expression = ". 'run.ps1' -Token s3cret";

        let stdin = StdinPayloadTransport.prepare(expression);
        assert!(stdin.arguments.ends_with("-Command -"));
        assert!(!stdin.arguments.contains("s3cret"));
        assert_eq!(stdin.standard_input.as_ref().unwrap()[0], expression);

        let encoded = EncodedCommandTransport.prepare(expression);
        assert!(encoded.standard_input.is_none());
        assert!(!encoded.arguments.contains("s3cret"));
        assert_eq!(EncodedCommandTransport::encode("hi"), "aABpAA==");
    }

    #[tokio::test]
    async fn inline_script_is_cleaned_up_and_token_exported() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        ctx.variables()
            .set("system.accessToken", "tok3n", true)
            .unwrap();
        let host = Arc::new(RecordingStepHost::new(0));
        let mut h = handler(&ctx, host.clone(), root.path(), inline("Write-Host hi"));

        h.run_async(&mut ctx).await.unwrap();

        let request = host.last_request();
        assert_eq!(request.environment["SYSTEM_ACCESSTOKEN"], "tok3n");
        assert!(!request.environment.contains_key("system.accessToken"));
        let stdin = request.options.standard_input.unwrap();
        let script = stdin[0]
            .trim_start_matches(". '")
            .trim_end_matches("' ")
            .to_string();
        assert!(script.ends_with(".ps1"));
        assert!(!Path::new(&script).exists());
        assert_eq!(
            request.working_directory,
            Path::new(&script).parent().unwrap().to_string_lossy()
        );
        assert_eq!(ctx.log_lines()[0], format!("##[command]{}", stdin[0]));
    }

    #[tokio::test]
    async fn stderr_is_buffered_into_one_error_per_burst() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let host = Arc::new(
            RecordingStepHost::new(0)
                .with_stderr(&["first", "second"])
                .with_stdout(&["between"])
                .with_stderr(&["third"]),
        );
        let mut h = handler(&ctx, host, root.path(), inline("x"));

        let err = h.run_async(&mut ctx).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Process completed with exit code 0 and had 2 error(s) written to the error stream."
        );
        assert_eq!(ctx.error_count(), 2);
        assert_eq!(ctx.issues()[0].message, "first\nsecond");
    }

    #[tokio::test]
    async fn stderr_is_plain_output_when_allowed() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let host = Arc::new(RecordingStepHost::new(0).with_stderr(&["warning text"]));
        let mut h = handler(
            &ctx,
            host,
            root.path(),
            PowerShellExeHandlerData {
                fail_on_standard_error: Some("false".into()),
                ..inline("x")
            },
        );

        h.run_async(&mut ctx).await.unwrap();
        assert!(ctx.log_lines().iter().any(|l| l == "warning text"));
        assert_eq!(ctx.error_count(), 0);
    }

    #[tokio::test]
    async fn script_path_is_resolved_for_the_step_host() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let script = root.path().join("scripts").join("deploy.ps1");
        std::fs::create_dir_all(script.parent().unwrap()).unwrap();
        std::fs::write(&script, "Write-Host deploy").unwrap();
        let host = Arc::new(
            RecordingStepHost::new(0).with_path_mapping(&root.path().to_string_lossy(), "/__w"),
        );
        let mut h = handler(
            &ctx,
            host.clone(),
            root.path(),
            PowerShellExeHandlerData {
                target: script.to_string_lossy().into_owned(),
                argument_format: "-Stage prod".into(),
                ..Default::default()
            },
        );

        h.run_async(&mut ctx).await.unwrap();

        let stdin = host.last_request().options.standard_input.unwrap();
        assert_eq!(stdin[0], ". '/__w/scripts/deploy.ps1' -Stage prod");
    }

    #[tokio::test]
    async fn relative_target_runs_in_the_default_task_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let host = Arc::new(RecordingStepHost::new(4));
        let mut h = handler(
            &ctx,
            host.clone(),
            root.path(),
            PowerShellExeHandlerData {
                target: "run.ps1".into(),
                payload_transport: PayloadTransportKind::EncodedCommand,
                ..Default::default()
            },
        );

        let err = h.run_async(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Process completed with exit code 4.");
        let request = host.last_request();
        assert!(request.arguments.contains("-EncodedCommand "));
        assert_eq!(
            request.working_directory,
            root.path().join("DefaultTaskWorkingDirectory").to_string_lossy()
        );
    }
}
