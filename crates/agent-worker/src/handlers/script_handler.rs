// ScriptHandler mapping `ScriptHandler.cs`.
// Writes an inline script to a temp file with a shell-specific prologue and runs
// it through the step host, so it lands in the job container when there is one.

use agent_common::{HandlerError, WellKnownDirectory};
use agent_sdk::{IOUtil, ProcessOptions};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::ScriptHandlerData;

/// How to invoke one interpreter on a script file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub command: String,
    /// `{0}` is replaced with the script path.
    pub arguments: String,
    pub extension: &'static str,
    /// First line(s) written before the user's script.
    pub prologue: Option<&'static str>,
}

impl ShellCommand {
    pub fn format_arguments(&self, script_path: &str) -> String {
        self.arguments.replace("{0}", script_path)
    }
}

pub struct ScriptHandlerHelpers;

impl ScriptHandlerHelpers {
    pub fn get_default_shell() -> &'static str {
        if cfg!(windows) {
            "cmd"
        } else {
            "bash"
        }
    }

    /// Known shell names map to a fixed invocation; anything else is taken as
    /// a command line with an optional `{0}` placeholder.
    pub fn parse_shell_option_string(shell: &str) -> ShellCommand {
        let known = |command: &str, arguments: &str, extension, prologue| ShellCommand {
            command: command.to_string(),
            arguments: arguments.to_string(),
            extension,
            prologue,
        };

        match shell.trim().to_ascii_lowercase().as_str() {
            "bash" => known(
                "bash",
                "--noprofile --norc '{0}'",
                "sh",
                Some("set -eo pipefail"),
            ),
            "sh" => known("sh", "-e '{0}'", "sh", None),
            "pwsh" | "powershell" => known(
                shell.trim(),
                "-NoLogo -NoProfile -NonInteractive -ExecutionPolicy Unrestricted -Command \". '{0}'\"",
                "ps1",
                Some("$ErrorActionPreference = 'stop'"),
            ),
            "cmd" => known(
                "cmd.exe",
                "/D /E:ON /V:OFF /S /C \"CALL \"{0}\"\"",
                "cmd",
                Some("@echo off"),
            ),
            "python" => known("python3", "'{0}'", "py", None),
            _ => {
                let trimmed = shell.trim();
                let (command, rest) = trimmed
                    .split_once(char::is_whitespace)
                    .unwrap_or((trimmed, ""));
                let arguments = if rest.contains("{0}") {
                    rest.trim().to_string()
                } else if rest.trim().is_empty() {
                    "'{0}'".to_string()
                } else {
                    format!("{} '{{0}}'", rest.trim())
                };
                ShellCommand {
                    command: command.to_string(),
                    arguments,
                    extension: Self::get_script_file_extension(command),
                    prologue: None,
                }
            }
        }
    }

    pub fn get_script_file_extension(shell: &str) -> &'static str {
        let basename = Path::new(shell)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(shell);

        match basename.to_ascii_lowercase().as_str() {
            "pwsh" | "powershell" => "ps1",
            "python" | "python3" => "py",
            "cmd" => "cmd",
            "node" | "nodejs" => "js",
            _ => "sh",
        }
    }

    pub fn script_contents(shell: &ShellCommand, script: &str) -> String {
        let newline = if shell.extension == "cmd" { "\r\n" } else { "\n" };
        match shell.prologue {
            Some(prologue) => format!("{prologue}{newline}{script}{newline}"),
            None => format!("{script}{newline}"),
        }
    }
}

pub struct ScriptHandler {
    base: HandlerBase,
    data: ScriptHandlerData,
}

impl ScriptHandler {
    pub fn new(base: HandlerBase, data: ScriptHandlerData) -> Self {
        Self { base, data }
    }

    fn temp_directory(&self, context: &ExecutionContext) -> PathBuf {
        context
            .variables()
            .agent_temp_directory()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.base.host_context().get_directory(WellKnownDirectory::Temp))
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        let script = self.base.get_input("script").unwrap_or_default().to_string();
        if script.trim().is_empty() {
            context.debug("Script body is empty, skipping.");
            return Ok(HandlerOutcome::default());
        }

        let shell = self
            .base
            .get_input("shell")
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.data.default_shell.clone())
            .unwrap_or_else(|| ScriptHandlerHelpers::get_default_shell().to_string());
        let shell = ScriptHandlerHelpers::parse_shell_option_string(&shell);

        let working_directory = self
            .base
            .get_input("workingDirectory")
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .or_else(|| context.variables().system_default_working_directory())
            .unwrap_or_default();

        self.base.add_inputs_to_environment();
        self.base.add_endpoints_to_environment(context)?;
        self.base.add_secure_files_to_environment(context);
        self.base.add_variables_to_environment(context, false, false)?;

        let temp_directory = self.temp_directory(context);
        IOUtil::ensure_directory(&temp_directory)?;
        let script_file = temp_directory.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            shell.extension
        ));
        std::fs::write(&script_file, ScriptHandlerHelpers::script_contents(&shell, &script))
            .with_context(|| format!("Failed to write script file: {}", script_file.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&script_file, std::fs::Permissions::from_mode(0o755));
        }

        let step_host = std::sync::Arc::clone(&self.base.step_host);
        let script_path = step_host.resolve_path_for_step_host(&script_file.to_string_lossy());
        let arguments = shell.format_arguments(&script_path);

        context.output("Script contents:");
        for line in script.lines() {
            context.output(line);
        }
        context.command(&format!("{} {}", shell.command, arguments));

        let options = ProcessOptions {
            require_exit_code_zero: false,
            kill_process_on_cancel: false,
            inherit_console_handler: !context.variables().retain_default_encoding(),
            ..Default::default()
        };
        let request =
            self.base
                .exec_request(context, &working_directory, &shell.command, &arguments, options);
        let result = self.base.execute(context, &request, None).await;

        if let Err(e) = IOUtil::delete_file(&script_file) {
            context.warning(&format!(
                "Unable to delete script file '{}': {e:#}",
                script_file.display()
            ));
        }

        let exit_code = result?.exit_code().unwrap_or_default();
        if exit_code != 0 {
            return Err(HandlerError::task(format!(
                "Process completed with exit code {exit_code}."
            ))
            .into());
        }
        Ok(HandlerOutcome::default())
    }
}
