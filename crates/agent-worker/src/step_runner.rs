// StepRunner mapping `StepsRunner.cs` and `TaskRunner.cs`.
// Runs one step: picks the step host, creates the handler, and folds whatever
// the handler returns into the step's result.

use agent_common::constants::variables::{agent, system};
use agent_common::{HandlerError, HostContext, TaskResult, WellKnownDirectory};
use agent_sdk::{
    ProcessCancelledError, ProcessExitCodeError, RepositoryResource, SecureFile, ServiceEndpoint,
    VariableValue,
};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::container::{ContainerInfo, DockerCommandManager};
use crate::execution_context::{ExecutionContext, Global};
use crate::handlers::{
    ContainerStepHost, DefaultStepHost, Handler, HandlerData, HandlerFactory, StepHost, StepSpec,
};
use crate::variables::Variables;

/// Steps without a timeout are cut off after this long.
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// One step and the slice of job state it runs against.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    #[serde(default = "default_display_name")]
    pub display_name: String,
    pub handler: HandlerData,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,
    #[serde(default)]
    pub task_variables: BTreeMap<String, VariableValue>,
    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub secure_files: Vec<SecureFile>,
    #[serde(default)]
    pub repositories: Vec<RepositoryResource>,
    #[serde(default)]
    pub prepend_path: Vec<String>,
    #[serde(default)]
    pub task_directory: PathBuf,
    /// Run inside this already-started container instead of on the host.
    #[serde(default)]
    pub container: Option<ContainerInfo>,
    #[serde(default)]
    pub timeout_in_minutes: u32,
}

fn default_display_name() -> String {
    "Step".to_string()
}

impl StepDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read step file '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse step file '{}'", path.display()))
    }
}

pub struct StepRunner {
    host_context: Arc<HostContext>,
}

impl StepRunner {
    pub fn new(host_context: Arc<HostContext>) -> Self {
        Self { host_context }
    }

    /// Build the job state a definition describes and run its step.
    pub async fn run(&self, definition: StepDefinition) -> Result<TaskResult> {
        let variables = Variables::from_values(
            self.host_context.secret_masker().clone(),
            &definition.variables,
        );
        self.set_default_variables(&variables);

        let mut global = Global::new(variables);
        global.endpoints = definition.endpoints;
        global.secure_files = definition.secure_files;
        global.repositories = definition.repositories;
        global.prepend_path = definition.prepend_path;

        let shutdown = self.host_context.shutdown_token();
        let job = ExecutionContext::new_root(Arc::clone(&self.host_context), global, "Job");
        let mut context = job.create_step_context(definition.display_name);
        let cancel = context.cancellation_token();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            cancel.cancel();
        });

        let step_host = self.step_host(definition.container)?;
        let handler = HandlerFactory::create(
            &context,
            step_host,
            definition.handler,
            StepSpec {
                inputs: definition.inputs,
                environment: definition.environment,
                task_variables: definition.task_variables,
                task_directory: definition.task_directory,
            },
        );

        let timeout = match definition.timeout_in_minutes {
            0 => DEFAULT_STEP_TIMEOUT,
            minutes => Duration::from_secs(u64::from(minutes) * 60),
        };
        Ok(run_step(&mut context, handler, timeout).await)
    }

    fn step_host(&self, container: Option<ContainerInfo>) -> Result<Arc<dyn StepHost>> {
        Ok(match container {
            Some(container) => {
                let root = self.host_context.get_directory(WellKnownDirectory::Root);
                let docker = DockerCommandManager::new(&self.host_context, &root.to_string_lossy())
                    .map_err(|e| HandlerError::infrastructure(format!("{e:#}")))?;
                Arc::new(ContainerStepHost::new(
                    Arc::clone(&self.host_context),
                    Arc::new(RwLock::new(container)),
                    Arc::new(docker),
                ))
            }
            None => Arc::new(DefaultStepHost::new(
                self.host_context.get_trace_writer("DefaultStepHost"),
            )),
        })
    }

    /// Agent locations the step file does not override.
    fn set_default_variables(&self, variables: &Variables) {
        let work = self.host_context.get_directory(WellKnownDirectory::Work);
        let defaults = [
            (
                agent::ROOT_DIRECTORY,
                self.host_context.get_directory(WellKnownDirectory::Root),
            ),
            (agent::WORK_FOLDER, work.clone()),
            (
                agent::TEMP_DIRECTORY,
                self.host_context.get_directory(WellKnownDirectory::Temp),
            ),
            (
                agent::SERVER_OM_DIRECTORY,
                self.host_context.get_directory(WellKnownDirectory::ServerOM),
            ),
            (system::DEFAULT_WORKING_DIRECTORY, work),
        ];
        for (name, value) in defaults {
            if variables.get(name).is_none() {
                let _ = variables.set(name, &value.to_string_lossy(), false);
            }
        }
    }
}

/// Run `handler` and close the step with the result its outcome maps to.
pub async fn run_step(
    context: &mut ExecutionContext,
    mut handler: Box<dyn Handler>,
    timeout: Duration,
) -> TaskResult {
    let cancel = context.cancellation_token();
    let (outcome, timed_out) = {
        let mut run = handler.run_async(context);
        tokio::select! {
            outcome = &mut run => (outcome, false),
            _ = tokio::time::sleep(timeout) => {
                // Let the handler walk its child through the cancel/kill path.
                cancel.cancel();
                (run.await, true)
            }
        }
    };

    if timed_out {
        if let Err(error) = &outcome {
            context.debug(&format!("Handler stopped after the timeout: {error:#}"));
        }
        context.error(&format!(
            "The step has exceeded the maximum execution time of {} minutes.",
            timeout.as_secs() / 60
        ));
        return context.complete(Some(TaskResult::Failed));
    }

    match outcome {
        Ok(outcome) => {
            context.apply_environment_diff(&outcome.environment_diff);
            context.complete(None)
        }
        Err(error) => fail_step(context, error),
    }
}

fn fail_step(context: &mut ExecutionContext, error: anyhow::Error) -> TaskResult {
    let message = format!("{error:#}");
    if error.downcast_ref::<ProcessCancelledError>().is_some()
        || context.cancellation_token().is_cancelled()
    {
        context.error(&message);
        return context.complete(Some(TaskResult::Canceled));
    }

    match HandlerError::classify(&error) {
        Some(HandlerError::Infrastructure(_)) => {
            context.error(&message);
            context.set_result(TaskResult::Failed);
            context.complete(None)
        }
        // The tool may have reported its own result before failing.
        Some(HandlerError::Task(_)) if context.result().is_some() => {
            context.debug(&format!(
                "Task result already set. Not failing the step: {message}"
            ));
            context.complete(None)
        }
        Some(_) | None => {
            if let Some(exit) = error.downcast_ref::<ProcessExitCodeError>() {
                context.debug(&format!("{} exited with {}", exit.file_name, exit.exit_code));
            }
            context.error(&message);
            context.complete(Some(TaskResult::Failed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::make_test_context;
    use crate::handlers::handler_data::{PowerShell3HandlerData, ProcessHandlerData};
    use crate::handlers::step_host::RecordingStepHost;

    fn create(ctx: &ExecutionContext, host: Arc<dyn StepHost>, data: HandlerData, dir: &Path) -> Box<dyn Handler> {
        HandlerFactory::create(
            ctx,
            host,
            data,
            StepSpec {
                inputs: BTreeMap::new(),
                environment: HashMap::new(),
                task_variables: BTreeMap::new(),
                task_directory: dir.to_path_buf(),
            },
        )
    }

    #[tokio::test]
    async fn powershell3_exit_one_marks_the_step_failed() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let dir = root.path().join("task");
        let sdk = dir.join("ps_modules").join("VstsTaskSdk");
        std::fs::create_dir_all(&sdk).unwrap();
        std::fs::write(sdk.join("VstsTaskSdk.psd1"), "@{}").unwrap();
        std::fs::write(dir.join("main.ps1"), "exit 1").unwrap();

        let handler = create(
            &ctx,
            Arc::new(RecordingStepHost::new(1)),
            HandlerData::PowerShell3(PowerShell3HandlerData {
                target: "main.ps1".into(),
                ..Default::default()
            }),
            &dir,
        );

        let result = run_step(&mut ctx, handler, DEFAULT_STEP_TIMEOUT).await;
        assert_eq!(result, TaskResult::Failed);
        assert_eq!(ctx.issues()[0].message, "Process completed with exit code 1.");
    }

    #[tokio::test]
    async fn task_failure_keeps_a_result_the_tool_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let host = RecordingStepHost::new(3)
            .with_stdout(&["##vso[task.complete result=SucceededWithIssues]partial"]);

        let handler = create(
            &ctx,
            Arc::new(host),
            HandlerData::Process(ProcessHandlerData {
                target: "tool".into(),
                ..Default::default()
            }),
            root.path(),
        );

        let result = run_step(&mut ctx, handler, DEFAULT_STEP_TIMEOUT).await;
        assert_eq!(result, TaskResult::SucceededWithIssues);
        assert_eq!(ctx.error_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_plugin_fails_after_a_reported_result() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        ctx.set_result(TaskResult::Succeeded);

        let handler = create(
            &ctx,
            Arc::new(RecordingStepHost::new(0)),
            HandlerData::AgentPlugin(crate::handlers::handler_data::AgentPluginHandlerData {
                target: "Unknown.Plugin, Unknown".into(),
            }),
            root.path(),
        );
        let result = run_step(&mut ctx, handler, DEFAULT_STEP_TIMEOUT).await;
        assert_eq!(result, TaskResult::Failed);
    }

    #[tokio::test]
    async fn successful_step_scopes_its_environment_into_the_job() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());

        struct Exporting(crate::handlers::HandlerBase);

        #[async_trait::async_trait]
        impl Handler for Exporting {
            fn base(&self) -> &crate::handlers::HandlerBase {
                &self.0
            }

            async fn run_async(
                &mut self,
                _context: &mut ExecutionContext,
            ) -> Result<crate::handlers::HandlerOutcome> {
                Ok(crate::handlers::HandlerOutcome {
                    environment_diff: BTreeMap::from([("EXPORTED".to_string(), "1".to_string())]),
                })
            }
        }

        let base = crate::handlers::HandlerBase::new(
            Arc::clone(ctx.host_context()),
            "Exporting",
            Arc::new(RecordingStepHost::new(0)),
            BTreeMap::new(),
            HashMap::new(),
            root.path().to_path_buf(),
        );
        let result = run_step(&mut ctx, Box::new(Exporting(base)), DEFAULT_STEP_TIMEOUT).await;

        assert_eq!(result, TaskResult::Succeeded);
        assert_eq!(ctx.job_environment()["EXPORTED"], "1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_stops_the_running_child() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let marker = root.path().join("marker");

        let handler = create(
            &ctx,
            Arc::new(DefaultStepHost::new(Arc::new(agent_sdk::NullTraceWriter))),
            HandlerData::Process(ProcessHandlerData {
                target: "sleep".into(),
                argument_format: format!("2 && touch '{}'", marker.display()),
                ..Default::default()
            }),
            root.path(),
        );

        let result = run_step(&mut ctx, handler, Duration::from_millis(300)).await;
        assert_eq!(result, TaskResult::Failed);
        assert!(ctx.cancellation_token().is_cancelled());
        assert!(ctx
            .log_lines()
            .iter()
            .any(|l| l.contains("exceeded the maximum execution time")));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn step_file_parses_with_defaults() {
        let definition: StepDefinition = serde_json::from_str(
            r#"{"handler": {"kind": "Process", "target": "echo", "argumentFormat": "hi"}}"#,
        )
        .unwrap();
        assert_eq!(definition.display_name, "Step");
        assert!(matches!(definition.handler, HandlerData::Process(ref p) if p.target == "echo"));
        assert!(definition.container.is_none());
    }
}
