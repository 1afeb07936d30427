// ProcessHandler mapping `ProcessHandler.cs`.
// Runs a target through the platform shell so built-in commands work, and can
// capture the environment the command leaves behind.

use agent_common::{constants, HandlerError};
use agent_sdk::{ArgUtil, OutputStream, ProcessOptions, StringUtil};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use crate::execution_context::{EnvironmentDiff, ExecutionContext};
use crate::handlers::handler::{add_prepend_path_to_environment, Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::ProcessHandlerData;

/// Never carried into the job environment.
const IGNORED_ENVIRONMENT: &[&str] = &[
    constants::TF_BUILD,
    constants::variables::agent::JOB_STATUS,
    // Maintained by the shell itself.
    "PWD",
    "OLDPWD",
    "SHLVL",
    "_",
];

pub struct ProcessHandler {
    base: HandlerBase,
    data: ProcessHandlerData,
}

impl ProcessHandler {
    pub fn new(base: HandlerBase, data: ProcessHandlerData) -> Self {
        Self { base, data }
    }

    /// `(shell, arguments)` for `command`, optionally followed by `echo <delimiter>`
    /// and an environment dump.
    fn shell_invocation(command: &str, delimiter: Option<&str>) -> (String, String) {
        if cfg!(windows) {
            let shell = std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string());
            let command = match delimiter {
                Some(d) => format!("{command} && echo {d} && set"),
                None => command.to_string(),
            };
            (shell, format!("/c \"{command}\""))
        } else {
            let command = match delimiter {
                Some(d) => format!("{command} && echo {d} && env"),
                None => command.to_string(),
            };
            (
                "/bin/sh".to_string(),
                format!("-c '{}'", command.replace('\'', r"'\''")),
            )
        }
    }

    fn resolve_target(&self, target: &str) -> String {
        let target = target.trim_matches('"');
        let candidate = self.base.task_directory.join(target);
        if !Path::new(target).is_absolute() && candidate.exists() {
            StringUtil::quote_if_needed(&candidate.to_string_lossy())
        } else {
            StringUtil::quote_if_needed(target)
        }
    }
}

#[async_trait]
impl Handler for ProcessHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        self.base.trace.entering("ProcessHandler::run_async");
        let variables = context.variables();

        let target = variables.expand_values(&self.data.target);
        ArgUtil::not_null_or_empty(&target, "Target").map_err(HandlerError::from)?;
        let target = self.resolve_target(&target);
        let arguments = variables.expand_values(&self.data.argument_format);

        let working_directory = match variables.expand_values(&self.data.working_directory) {
            dir if !dir.is_empty() => dir,
            _ => variables.system_default_working_directory().unwrap_or_default(),
        };
        if !working_directory.is_empty() {
            ArgUtil::directory_exists(Path::new(&working_directory), "workingDirectory")
                .map_err(HandlerError::from)?;
        }

        let modify_environment = StringUtil::convert_to_bool_or(
            self.data
                .modify_environment
                .as_deref()
                .map(|v| variables.expand_values(v))
                .as_deref(),
            false,
        );
        let fail_on_standard_error = StringUtil::convert_to_bool_or(
            self.data
                .fail_on_standard_error
                .as_deref()
                .map(|v| variables.expand_values(v))
                .as_deref(),
            false,
        );

        self.base.add_inputs_to_environment();
        self.base.add_endpoints_to_environment(context)?;
        self.base.add_secure_files_to_environment(context);
        self.base.add_variables_to_environment(context, false, false)?;

        let command = if arguments.is_empty() {
            target.clone()
        } else {
            format!("{target} {arguments}")
        };
        let delimiter = modify_environment.then(|| format!("----{}----", Uuid::new_v4().simple()));
        let (shell, shell_arguments) = Self::shell_invocation(&command, delimiter.as_deref());
        context.command(&command);

        let options = ProcessOptions {
            require_exit_code_zero: false,
            kill_process_on_cancel: false,
            inherit_console_handler: !variables.retain_default_encoding(),
            ..Default::default()
        };
        let request =
            self.base
                .exec_request(context, &working_directory, &shell, &shell_arguments, options);

        // What the child started with, so only real changes are reported.
        let mut input_environment = request.environment.clone();
        add_prepend_path_to_environment(&mut input_environment, &request.prepend_path);

        let mut seen_delimiter = false;
        let mut captured: HashMap<String, String> = HashMap::new();
        let mut stderr_count = 0usize;
        let commands = std::sync::Arc::clone(&self.base.commands);

        let outcome = self
            .base
            .execute_with(context, &request, None, |ctx, line| match line.stream {
                OutputStream::Stdout if seen_delimiter => {
                    if let Some((name, value)) = line.data.split_once('=') {
                        if !name.is_empty() {
                            captured.insert(name.to_string(), value.to_string());
                        }
                    }
                }
                OutputStream::Stdout
                    if delimiter.as_deref().is_some_and(|d| line.data.trim() == d) =>
                {
                    seen_delimiter = true;
                }
                OutputStream::Stderr if fail_on_standard_error => {
                    stderr_count += 1;
                    ctx.error(&line.data);
                }
                _ => commands.process_output_line(ctx, &line.data),
            })
            .await?;

        let exit_code = outcome.exit_code().unwrap_or_default();
        if exit_code != 0 {
            return Err(HandlerError::task(format!(
                "Process completed with exit code {exit_code}."
            ))
            .into());
        }
        if stderr_count > 0 {
            return Err(HandlerError::task(format!(
                "Process completed with exit code {exit_code} and had {stderr_count} error(s) written to the error stream."
            ))
            .into());
        }

        let environment_diff = if seen_delimiter {
            environment_changes(&captured, &input_environment)
        } else {
            EnvironmentDiff::new()
        };
        if !environment_diff.is_empty() {
            context.debug(&format!(
                "Environment changes carried into the job: {}",
                environment_diff.keys().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        Ok(HandlerOutcome { environment_diff })
    }
}

/// Entries of `captured` that differ from what the child was given.
fn environment_changes(
    captured: &HashMap<String, String>,
    input_environment: &HashMap<String, String>,
) -> EnvironmentDiff {
    captured
        .iter()
        .filter(|(name, _)| {
            !IGNORED_ENVIRONMENT
                .iter()
                .any(|ignored| ignored.eq_ignore_ascii_case(name))
        })
        .filter(|(name, value)| {
            let before = agent_common::VarUtil::get_env(input_environment, name)
                .map(str::to_string)
                .or_else(|| std::env::var(name).ok());
            before.as_deref() != Some(value.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
