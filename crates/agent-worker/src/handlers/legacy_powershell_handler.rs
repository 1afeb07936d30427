// LegacyPowerShellHandler mapping `LegacyPowerShellHandler.cs`.
// Drives the out-of-process legacy PowerShell host. Everything the host needs
// travels in `VSTSPSHOST*` environment variables, and its exit code is an error
// count. Serves both the `PowerShell` and `AzurePowerShell` variants.

use agent_common::constants::variables::build;
use agent_common::{HandlerError, TaskResult, WellKnownDirectory};
use agent_sdk::{ArgUtil, IOUtil, ProcessOptions, StringUtil, TraceWriter};
use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::PowerShellHandlerData;

pub const LEGACY_HOST_EXE: &str = "LegacyVSTSPowerShellHost.exe";

const CONNECTED_SERVICE_NAME: &str = "ConnectedServiceName";
const CONNECTED_SERVICE_NAME_SELECTOR: &str = "ConnectedServiceNameSelector";
const AZURE_MODULE: &str = "Microsoft.TeamFoundation.DistributedTask.Task.Deployment.Azure\\Microsoft.TeamFoundation.DistributedTask.Task.Deployment.Azure.psm1";

/// A token is a run of non-space characters, where a double-quoted section may
/// contain spaces.
static ARGUMENT_MATCHING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^" ]*("[^"]*")[^" ]*)|[^" ]+"#).expect("Invalid argument regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyHostFlavor {
    PowerShell,
    AzurePowerShell,
}

/// How the host receives the task's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyArguments {
    /// No argument format: the host passes the inputs as arguments.
    InputsAsArguments,
    List(Vec<String>),
    Named(BTreeMap<String, String>),
}

/// Split an argument format into a positional list, or into a flag to value map
/// when the first token starts with `-`. A flag with no value maps to the empty
/// string.
pub fn parse_argument_format(format: &str) -> Result<LegacyArguments, HandlerError> {
    let tokens: Vec<&str> = ARGUMENT_MATCHING
        .find_iter(format)
        .map(|m| m.as_str())
        .collect();
    let Some(first) = tokens.first() else {
        return Ok(LegacyArguments::InputsAsArguments);
    };

    if !first.starts_with('-') {
        return Ok(LegacyArguments::List(
            tokens.into_iter().map(str::to_string).collect(),
        ));
    }

    let mut named = BTreeMap::new();
    let mut current_key: Option<String> = None;
    for token in tokens {
        if token.starts_with('-') {
            let key = token.trim_matches('-').to_string();
            named.insert(key.clone(), String::new());
            current_key = Some(key);
        } else if let Some(key) = current_key.take() {
            named.insert(key, token.to_string());
        } else {
            return Err(HandlerError::task(format!(
                "Found value {token} with no corresponding named parameter"
            )));
        }
    }
    Ok(LegacyArguments::Named(named))
}

/// What the host's exit code means for the step.
///
/// The exit code doubles as an error count: positive is the number of error
/// records the script produced, negative is a failure of the host itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyHostExit {
    Clean,
    /// Errors were reported but the step already has a result.
    ErrorsIgnored(i32),
    ScriptErrors(i32),
    HostFailure(i32),
}

pub fn map_legacy_host_exit_code(exit_code: i32, existing: Option<TaskResult>) -> LegacyHostExit {
    match exit_code {
        0 => LegacyHostExit::Clean,
        n if n > 0 && existing.is_some() => LegacyHostExit::ErrorsIgnored(n),
        n if n > 0 => LegacyHostExit::ScriptErrors(n),
        n => LegacyHostExit::HostFailure(n),
    }
}

/// One cmdlet call the host runs before the script, in the tuple shape it reads.
#[derive(Debug, Serialize)]
struct HostStatement {
    #[serde(rename = "Item1")]
    command: String,
    #[serde(rename = "Item2")]
    parameters: Vec<HostParameter>,
}

#[derive(Debug, Serialize)]
struct HostParameter {
    #[serde(rename = "Item1")]
    name: String,
    #[serde(rename = "Item2")]
    value: String,
}

impl HostParameter {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

pub struct LegacyPowerShellHandler {
    base: HandlerBase,
    data: PowerShellHandlerData,
    flavor: LegacyHostFlavor,
}

impl LegacyPowerShellHandler {
    pub fn new(base: HandlerBase, data: PowerShellHandlerData, flavor: LegacyHostFlavor) -> Self {
        Self { base, data, flavor }
    }

    fn add_legacy_host_environment_variables(
        &mut self,
        context: &ExecutionContext,
        script_file: &Path,
        working_directory: &Path,
    ) -> Result<()> {
        let variables = context.variables();

        self.base.add_environment_variable(
            "VSTSPSHOSTSCRIPTNAME",
            Some(&script_file.to_string_lossy()),
        );
        self.base.add_environment_variable(
            "VSTSPSHOSTWORKINGFOLDER",
            Some(&working_directory.to_string_lossy()),
        );
        self.base.add_environment_variable(
            "VSTSPSHOSTOUTPUTPREFER",
            Some(if variables.system_debug() {
                "Continue"
            } else {
                "SilentlyContinue"
            }),
        );
        if !self.base.inputs.is_empty() {
            let inputs = StringUtil::convert_to_json_compact(&self.base.inputs)?;
            self.base
                .add_environment_variable("VSTSPSHOSTINPUTPARAMETER", Some(&inputs));
        }

        match parse_argument_format(&self.data.argument_format)? {
            LegacyArguments::InputsAsArguments => {
                self.base
                    .add_environment_variable("VSTSPSHOSTINPUTISARG", Some("True"));
            }
            LegacyArguments::List(arguments) => {
                let json = StringUtil::convert_to_json_compact(&arguments)?;
                self.base.add_environment_variable("VSTSPSHOSTARGS", Some(&json));
            }
            LegacyArguments::Named(parameters) => {
                let json = StringUtil::convert_to_json_compact(&parameters)?;
                self.base
                    .add_environment_variable("VSTSPSHOSTARGPARAMETER", Some(&json));
            }
        }

        let public = variables.public();
        for (name, value) in public.iter().chain(variables.private().iter()) {
            self.base
                .add_environment_variable(&format!("VSTSPSHOSTVAR_{name}"), Some(value));
        }
        for (name, value) in &public {
            self.base
                .add_environment_variable(&format!("VSTSPSHOSTPUBVAR_{name}"), Some(value));
        }

        self.add_endpoints(context)?;

        if self.flavor == LegacyHostFlavor::AzurePowerShell {
            let statements = self.azure_statements()?;
            let json = StringUtil::convert_to_json_compact(&statements)?;
            self.base
                .add_environment_variable("VSTSPSHOSTSTATEMENTS", Some(&json));
        }
        Ok(())
    }

    fn add_endpoints(&mut self, context: &ExecutionContext) -> Result<()> {
        let mut ids: Vec<String> = Vec::new();
        for endpoint in context.endpoints() {
            let authorization = StringUtil::convert_to_json_compact(&endpoint.authorization)?;
            if endpoint.is_system_connection() {
                self.base
                    .add_environment_variable("VSTSPSHOSTSYSTEMENDPOINT_URL", Some(&endpoint.url));
                self.base.add_environment_variable(
                    "VSTSPSHOSTSYSTEMENDPOINT_AUTH",
                    Some(&authorization),
                );
                continue;
            }

            // Source endpoints have no id; the host finds them by repository id and name.
            let repository_id = endpoint
                .data
                .get("repositoryId")
                .filter(|_| endpoint.id.is_nil());
            let (partial_key, name) = match repository_id {
                Some(repository_id) => (repository_id.to_uppercase(), endpoint.name.clone()),
                None => (
                    endpoint.id.hyphenated().to_string().to_uppercase(),
                    endpoint.id.to_string(),
                ),
            };

            self.base.add_environment_variable(
                &format!("VSTSPSHOSTENDPOINT_URL_{partial_key}"),
                Some(&endpoint.url),
            );
            self.base.add_environment_variable(
                &format!("VSTSPSHOSTENDPOINT_NAME_{partial_key}"),
                Some(&name),
            );
            self.base.add_environment_variable(
                &format!("VSTSPSHOSTENDPOINT_TYPE_{partial_key}"),
                Some(&endpoint.endpoint_type),
            );
            self.base.add_environment_variable(
                &format!("VSTSPSHOSTENDPOINT_AUTH_{partial_key}"),
                Some(&authorization),
            );
            let data = StringUtil::convert_to_json_compact(&endpoint.data)?;
            self.base.add_environment_variable(
                &format!("VSTSPSHOSTENDPOINT_DATA_{partial_key}"),
                Some(&data),
            );
            ids.push(partial_key);
        }

        let variables = context.variables();
        if let Some(repo_name) = variables.get(build::REPO_NAME).filter(|n| !n.is_empty()) {
            let default_repo = context.repositories().into_iter().find(|r| {
                r.property("name")
                    .is_some_and(|n| n.eq_ignore_ascii_case(&repo_name))
            });
            if let Some(repo) = default_repo {
                if !ids.iter().any(|id| id.eq_ignore_ascii_case(&repo.id)) {
                    let repo_type = variables.get(build::REPO_PROVIDER);
                    self.base.add_environment_variable(
                        &format!("VSTSPSHOSTENDPOINT_URL_{}", repo.id),
                        repo.url.as_deref(),
                    );
                    self.base.add_environment_variable(
                        &format!("VSTSPSHOSTENDPOINT_NAME_{}", repo.id),
                        Some(&repo_name),
                    );
                    self.base.add_environment_variable(
                        &format!("VSTSPSHOSTENDPOINT_TYPE_{}", repo.id),
                        repo_type.as_deref(),
                    );
                    ids.push(repo.id);
                }
            }
        }

        if !ids.is_empty() {
            let json = StringUtil::convert_to_json_compact(&ids)?;
            self.base
                .add_environment_variable("VSTSPSHOSTENDPOINT_IDS", Some(&json));
        }
        Ok(())
    }

    /// Import the Azure support module and select the subscription before the script runs.
    fn azure_statements(&self) -> Result<Vec<HostStatement>, HandlerError> {
        let connected_service = self.connected_service()?;
        let storage_account = self.base.get_input("StorageAccount").unwrap_or_default();
        let module = self
            .base
            .host_context()
            .get_directory(WellKnownDirectory::LegacyPSHost)
            .join(AZURE_MODULE);

        Ok(vec![
            HostStatement {
                command: "Import-Module".to_string(),
                parameters: vec![
                    HostParameter::new("Name", &module.to_string_lossy()),
                    HostParameter::new("Scope", "Global"),
                ],
            },
            HostStatement {
                command: "Initialize-AzurePowerShellSupport".to_string(),
                parameters: vec![
                    HostParameter::new(CONNECTED_SERVICE_NAME, &connected_service),
                    HostParameter::new("StorageAccount", storage_account),
                ],
            },
        ])
    }

    fn connected_service(&self) -> Result<String, HandlerError> {
        let input_name = self
            .base
            .get_input(CONNECTED_SERVICE_NAME_SELECTOR)
            .unwrap_or(CONNECTED_SERVICE_NAME);

        let value = self
            .base
            .get_input(input_name)
            .or_else(|| self.base.get_input("DeploymentEnvironmentName"))
            .ok_or_else(|| {
                HandlerError::task(format!(
                    "The required {input_name} parameter was not found by the AzurePowerShellRunner."
                ))
            })?;
        if value.is_empty() {
            return Err(HandlerError::task(format!(
                "The required {input_name} parameter was either null or empty. Ensure you have provisioned a Deployment Environment using services tab in Admin UI."
            )));
        }
        Ok(value.to_string())
    }
}

#[async_trait]
impl Handler for LegacyPowerShellHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        self.base.trace.entering("LegacyPowerShellHandler::run_async");
        ArgUtil::directory_exists(&self.base.task_directory, "TaskDirectory")
            .map_err(HandlerError::from)?;

        let variables = context.variables();
        let target = variables.expand_values(&self.data.target);
        ArgUtil::not_null_or_empty(&target, "target").map_err(HandlerError::from)?;
        let script_file = self.base.task_directory.join(&target);
        ArgUtil::file_exists(&script_file, "scriptFile").map_err(HandlerError::from)?;

        let working_directory = match variables.expand_values(&self.data.working_directory) {
            dir if dir.is_empty() => script_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            dir => {
                let dir = PathBuf::from(dir);
                IOUtil::ensure_directory(&dir)?;
                dir
            }
        };

        context.output("Preparing task execution handler.");
        let host_context = self.base.host_context().clone();
        let legacy_host_directory = host_context.get_directory(WellKnownDirectory::LegacyPSHost);
        IOUtil::copy_directory(
            &host_context.get_directory(WellKnownDirectory::ServerOM),
            &legacy_host_directory,
        )
        .map_err(|e| HandlerError::infrastructure(format!("{e:#}")))?;
        self.base.trace.info("Finished copying files.");

        self.add_legacy_host_environment_variables(context, &script_file, &working_directory)?;

        let options = ProcessOptions {
            require_exit_code_zero: false,
            // Let the host finish and report the errors it has collected.
            kill_process_on_cancel: false,
            inherit_console_handler: !variables.retain_default_encoding(),
            ..Default::default()
        };
        let host_exe = legacy_host_directory.join(LEGACY_HOST_EXE);
        context.command(&host_exe.to_string_lossy());
        let request = self.base.exec_request(
            context,
            &working_directory.to_string_lossy(),
            &host_exe.to_string_lossy(),
            "",
            options,
        );
        let exit_code = self
            .base
            .execute(context, &request, None)
            .await?
            .exit_code()
            .unwrap_or_default();

        match map_legacy_host_exit_code(exit_code, context.result()) {
            LegacyHostExit::Clean => {}
            LegacyHostExit::ErrorsIgnored(n) => {
                context.debug(&format!(
                    "Task result already set. Not failing due to error count ({n})."
                ));
            }
            LegacyHostExit::ScriptErrors(n) => {
                context.set_result(TaskResult::Failed);
                context.error(&format!("PowerShell script completed with {n} errors."));
            }
            LegacyHostExit::HostFailure(n) => {
                return Err(HandlerError::infrastructure(format!(
                    "{LEGACY_HOST_EXE} completed with return code: {n}."
                ))
                .into());
            }
        }
        Ok(HandlerOutcome::default())
    }
}
