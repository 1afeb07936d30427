// Handler mapping `Handler.cs`.
// The strategy interface every handler implements, the state the factory wires
// into each of them, and the environment builder they share.

use agent_common::{HandlerError, HostContext, Tracing, VarUtil, WellKnownDirectory};
use agent_sdk::path_util::PATH_VARIABLE;
use agent_sdk::{
    OutputEncoding, PathUtil, ProcessCancelledError, ProcessDataReceivedEventArgs,
    ProcessExitCodeError, ProcessOptions, StringUtil, TraceWriter,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command_manager::WorkerCommandManager;
use crate::execution_context::{EnvironmentDiff, ExecutionContext};
use crate::handlers::output_manager::{pump_output, ExecOutcome};
use crate::handlers::step_host::{ExecRequest, StepHost};

/// Partial key used for the agent's own server connection.
pub const SYSTEM_CONNECTION_KEY: &str = "SYSTEMVSSCONNECTION";

/// What a handler hands back besides success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Environment changes the step made, for the caller to scope into the job.
    pub environment_diff: EnvironmentDiff,
}

#[async_trait]
pub trait Handler: Send {
    fn base(&self) -> &HandlerBase;

    /// Run the step. An `Err` is a step failure; see `HandlerError` for the classes.
    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome>;
}

/// Fields every strategy carries. Filled in by the handler factory.
pub struct HandlerBase {
    pub step_host: Arc<dyn StepHost>,
    pub inputs: BTreeMap<String, String>,
    /// The child's environment. Owned by this handler for one step only.
    pub environment: HashMap<String, String>,
    pub task_directory: PathBuf,
    pub(crate) host_context: Arc<HostContext>,
    pub(crate) commands: Arc<WorkerCommandManager>,
    pub(crate) trace: Tracing,
}

impl HandlerBase {
    pub fn new(
        host_context: Arc<HostContext>,
        trace_name: &str,
        step_host: Arc<dyn StepHost>,
        inputs: BTreeMap<String, String>,
        environment: HashMap<String, String>,
        task_directory: PathBuf,
    ) -> Self {
        let trace = host_context.get_trace(trace_name);
        Self {
            step_host,
            inputs,
            environment,
            task_directory,
            host_context,
            commands: Arc::new(WorkerCommandManager::new()),
            trace,
        }
    }

    pub fn host_context(&self) -> &Arc<HostContext> {
        &self.host_context
    }

    /// Case-insensitive input lookup.
    pub fn get_input(&self, name: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `target` under the task directory unless it is already absolute.
    pub fn resolve_task_path(&self, target: &str) -> PathBuf {
        let path = Path::new(target);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.task_directory.join(path)
        }
    }

    // -----------------------------------------------------------------------
    // Environment builder
    // -----------------------------------------------------------------------

    /// Last write wins. `None` becomes the empty string.
    pub fn add_environment_variable(&mut self, key: &str, value: Option<&str>) {
        let value = value.unwrap_or_default();
        self.trace
            .verbose(&format!("Setting env '{key}' to '{value}'."));
        VarUtil::set_env(&mut self.environment, key, value);
    }

    pub fn add_inputs_to_environment(&mut self) {
        let inputs: Vec<(String, String)> = self
            .inputs
            .iter()
            .map(|(k, v)| (input_environment_key(k), v.clone()))
            .collect();
        for (key, value) in inputs {
            self.add_environment_variable(&key, Some(&value));
        }
    }

    pub fn add_endpoints_to_environment(&mut self, context: &ExecutionContext) -> Result<()> {
        for endpoint in context.endpoints() {
            let is_system = endpoint.is_system_connection();
            if endpoint.id.is_nil() && !is_system {
                continue;
            }

            let partial_key = if is_system {
                SYSTEM_CONNECTION_KEY.to_string()
            } else {
                endpoint_partial_key(&endpoint.id)
            };

            self.add_environment_variable(
                &format!("ENDPOINT_URL_{partial_key}"),
                Some(&endpoint.url),
            );
            let auth = StringUtil::convert_to_json_compact(&endpoint.authorization)?;
            self.add_environment_variable(&format!("ENDPOINT_AUTH_{partial_key}"), Some(&auth));

            if !endpoint.id.is_nil() {
                let data = StringUtil::convert_to_json_compact(&endpoint.data)?;
                self.add_environment_variable(&format!("ENDPOINT_DATA_{partial_key}"), Some(&data));
            }
        }
        Ok(())
    }

    pub fn add_secure_files_to_environment(&mut self, context: &ExecutionContext) {
        for secure_file in context.secure_files() {
            if secure_file.id.is_nil() {
                continue;
            }
            let partial_key = secure_file.id.to_string();
            self.add_environment_variable(
                &format!("SECUREFILE_NAME_{partial_key}"),
                Some(&secure_file.name),
            );
            self.add_environment_variable(
                &format!("SECUREFILE_TICKET_{partial_key}"),
                Some(&secure_file.ticket),
            );
        }
    }

    /// Variables are written under their own names. `exclude_names` drops the
    /// public ones (except `agent.jobstatus`), `exclude_secrets` the secret ones.
    pub fn add_variables_to_environment(
        &mut self,
        context: &ExecutionContext,
        exclude_names: bool,
        exclude_secrets: bool,
    ) -> Result<()> {
        let variables = context.variables();

        let public = variables.public();
        let mut names = Vec::with_capacity(public.len());
        for (name, value) in public {
            if !exclude_names
                || name.eq_ignore_ascii_case(agent_common::constants::variables::agent::JOB_STATUS)
            {
                self.add_environment_variable(&name, Some(&value));
            }
            names.push(name);
        }
        if !exclude_names {
            let names = StringUtil::convert_to_json_compact(&names)?;
            self.add_environment_variable("VSTS_PUBLIC_VARIABLES", Some(&names));
        }

        if !exclude_secrets {
            let private = variables.private();
            let mut secret_names = Vec::with_capacity(private.len());
            for (name, value) in private {
                self.add_environment_variable(&name, Some(&value));
                secret_names.push(name);
            }
            let names = StringUtil::convert_to_json_compact(&secret_names)?;
            self.add_environment_variable("VSTS_SECRET_VARIABLES", Some(&names));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    pub fn exec_request(
        &self,
        context: &ExecutionContext,
        working_directory: &str,
        file_name: &str,
        arguments: &str,
        options: ProcessOptions,
    ) -> ExecRequest {
        ExecRequest {
            working_directory: working_directory.to_string(),
            file_name: file_name.to_string(),
            arguments: arguments.to_string(),
            environment: self.environment.clone(),
            prepend_path: context.prepend_path(),
            options,
        }
    }

    /// Run through the step host with every line offered to the command
    /// interpreter first.
    pub async fn execute(
        &self,
        context: &mut ExecutionContext,
        request: &ExecRequest,
        force_completed: Option<CancellationToken>,
    ) -> Result<ExecOutcome> {
        let commands = Arc::clone(&self.commands);
        self.execute_with(context, request, force_completed, |ctx, line| {
            commands.process_output_line(ctx, &line.data);
        })
        .await
    }

    /// Run through the step host, handing each line to `on_line` in arrival order.
    pub async fn execute_with<F>(
        &self,
        context: &mut ExecutionContext,
        request: &ExecRequest,
        force_completed: Option<CancellationToken>,
        on_line: F,
    ) -> Result<ExecOutcome>
    where
        F: FnMut(&mut ExecutionContext, ProcessDataReceivedEventArgs) + Send,
    {
        let step_host = Arc::clone(&self.step_host);
        Self::execute_on(step_host.as_ref(), context, request, force_completed, on_line).await
    }

    /// Like [`HandlerBase::execute_with`] but on an explicit host, for work that
    /// must stay on the agent machine whatever the step's target is.
    pub async fn execute_on<F>(
        step_host: &dyn StepHost,
        context: &mut ExecutionContext,
        request: &ExecRequest,
        force_completed: Option<CancellationToken>,
        mut on_line: F,
    ) -> Result<ExecOutcome>
    where
        F: FnMut(&mut ExecutionContext, ProcessDataReceivedEventArgs) + Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let exec = step_host.execute(request, tx, context.cancellation_token());
        pump_output(exec, rx, force_completed, |line| on_line(context, line))
            .await
            .map_err(classify_exec_error)
    }

    /// Run a JavaScript entry point on the externals node runtime the step host
    /// picks for `preferred_runtime`. A `task.complete` ends the step even if
    /// the process is still running.
    pub async fn run_node_script(
        &self,
        context: &mut ExecutionContext,
        preferred_runtime: &str,
        target: &Path,
        working_directory: &str,
    ) -> Result<HandlerOutcome> {
        let step_host = Arc::clone(&self.step_host);
        let version = step_host
            .determine_node_runtime_version(context, preferred_runtime)
            .await?;
        let externals = self.host_context.get_directory(WellKnownDirectory::Externals);
        let node = step_host
            .resolve_path_for_step_host(&node_executable(&externals, &version).to_string_lossy());
        let arguments = quote_script_argument(
            &step_host.resolve_path_for_step_host(&target.to_string_lossy()),
        );
        context.command(&format!("{node} {arguments}"));

        let options = ProcessOptions {
            require_exit_code_zero: false,
            kill_process_on_cancel: false,
            // node does not follow the console code page on Windows.
            output_encoding: cfg!(windows).then_some(OutputEncoding::Utf8),
            inherit_console_handler: !context.variables().retain_default_encoding(),
            ..Default::default()
        };
        let request = self.exec_request(context, working_directory, &node, &arguments, options);
        let force_completed = context.force_completed_token();

        match self.execute(context, &request, Some(force_completed)).await? {
            ExecOutcome::ForceCompleted => {
                context.debug(
                    "The task was marked as \"done\", but the process has not closed. Treating the task as complete.",
                );
                Ok(HandlerOutcome::default())
            }
            ExecOutcome::Exited(0) => Ok(HandlerOutcome::default()),
            ExecOutcome::Exited(code) => Err(HandlerError::task(format!(
                "Process completed with exit code {code}."
            ))
            .into()),
        }
    }
}

/// `<externals>/<version>/bin/node[.exe]`.
pub fn node_executable(externals: &Path, version: &str) -> PathBuf {
    let file = if cfg!(windows) { "node.exe" } else { "node" };
    externals.join(version).join("bin").join(file)
}

/// The script argument, quoted with inner quotes escaped.
pub fn quote_script_argument(path: &str) -> String {
    format!("\"{}\"", path.replace('"', "\\\""))
}

/// `INPUT_<NAME>` with spaces turned into underscores, upper-cased.
pub fn input_environment_key(name: &str) -> String {
    format!("INPUT_{}", name.replace(' ', "_").to_uppercase())
}

/// The endpoint id as a hyphenated, upper-case guid.
pub fn endpoint_partial_key(id: &uuid::Uuid) -> String {
    id.hyphenated().to_string().to_uppercase()
}

/// Merge the job's prepend-path entries in front of the `PATH` the child would see.
pub fn add_prepend_path_to_environment(environment: &mut HashMap<String, String>, prepend: &[String]) {
    if prepend.is_empty() {
        return;
    }

    let joined = PathUtil::join_prepend_entries(prepend);
    let current = VarUtil::get_env(environment, PATH_VARIABLE)
        .map(str::to_string)
        .or_else(|| std::env::var(PATH_VARIABLE).ok())
        .unwrap_or_default();
    VarUtil::set_env(
        environment,
        PATH_VARIABLE,
        &PathUtil::prepend_path(&joined, &current),
    );
}

/// Launch failures that are not the tool's own doing are infrastructure failures.
fn classify_exec_error(error: anyhow::Error) -> anyhow::Error {
    if HandlerError::classify(&error).is_some()
        || error.downcast_ref::<ProcessExitCodeError>().is_some()
        || error.downcast_ref::<ProcessCancelledError>().is_some()
    {
        return error;
    }
    anyhow::Error::new(HandlerError::infrastructure(format!("{error:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::make_test_context;
    use crate::handlers::step_host::RecordingStepHost;
    use agent_sdk::{EndpointAuthorization, SecureFile, ServiceEndpoint};
    use uuid::Uuid;

    fn base(ctx: &ExecutionContext, host: Arc<dyn StepHost>) -> HandlerBase {
        HandlerBase::new(
            Arc::clone(ctx.host_context()),
            "HandlerTest",
            host,
            BTreeMap::new(),
            HashMap::new(),
            PathBuf::from("/tasks/demo"),
        )
    }

    #[test]
    fn inputs_are_normalized() {
        let root = tempfile::tempdir().unwrap();
        let ctx = make_test_context(root.path());
        let mut handler = base(&ctx, Arc::new(RecordingStepHost::new(0)));
        handler.inputs.insert("My input.name".into(), "v1".into());
        handler.inputs.insert("other".into(), String::new());

        handler.add_inputs_to_environment();

        assert_eq!(handler.environment.get("INPUT_MY_INPUT.NAME").unwrap(), "v1");
        assert_eq!(handler.environment.get("INPUT_OTHER").unwrap(), "");
        assert_eq!(handler.get_input("MY INPUT.NAME"), Some("v1"));
    }

    #[test]
    fn endpoint_keys_use_id_or_system_sentinel() {
        let root = tempfile::tempdir().unwrap();
        let ctx = make_test_context(root.path());
        let id = Uuid::parse_str("5e5e5e5e-0000-4000-8000-00000000abcd").unwrap();
        {
            let mut global = ctx.global_mut();
            global.endpoints.push(ServiceEndpoint {
                id,
                name: "github".into(),
                url: "https://github.com".into(),
                authorization: Some(EndpointAuthorization {
                    scheme: "Token".into(),
                    ..Default::default()
                }),
                data: BTreeMap::from([("org".to_string(), "octo".to_string())]),
                ..Default::default()
            });
            global.endpoints.push(ServiceEndpoint {
                name: "SystemVssConnection".into(),
                url: "https://dev.azure.com/org".into(),
                ..Default::default()
            });
            global.endpoints.push(ServiceEndpoint {
                name: "anonymous".into(),
                url: "https://nowhere".into(),
                ..Default::default()
            });
        }

        let mut handler = base(&ctx, Arc::new(RecordingStepHost::new(0)));
        handler.add_endpoints_to_environment(&ctx).unwrap();

        let key = "5E5E5E5E-0000-4000-8000-00000000ABCD";
        assert_eq!(endpoint_partial_key(&id), key);
        let env = &handler.environment;
        assert_eq!(env[&format!("ENDPOINT_URL_{key}")], "https://github.com");
        assert_eq!(
            env[&format!("ENDPOINT_AUTH_{key}")],
            r#"{"scheme":"Token","parameters":{}}"#
        );
        assert_eq!(env[&format!("ENDPOINT_DATA_{key}")], r#"{"org":"octo"}"#);
        assert_eq!(env["ENDPOINT_URL_SYSTEMVSSCONNECTION"], "https://dev.azure.com/org");
        assert!(env.contains_key("ENDPOINT_AUTH_SYSTEMVSSCONNECTION"));
        assert!(!env.contains_key("ENDPOINT_DATA_SYSTEMVSSCONNECTION"));
        assert_eq!(env.len(), 5);
    }

    #[test]
    fn secure_files_are_keyed_by_id() {
        let root = tempfile::tempdir().unwrap();
        let ctx = make_test_context(root.path());
        let id = Uuid::new_v4();
        ctx.global_mut().secure_files.push(SecureFile {
            id,
            name: "signing.p12".into(),
            ticket: "t1cket".into(),
        });

        let mut handler = base(&ctx, Arc::new(RecordingStepHost::new(0)));
        handler.add_secure_files_to_environment(&ctx);

        assert_eq!(handler.environment[&format!("SECUREFILE_NAME_{id}")], "signing.p12");
        assert_eq!(handler.environment[&format!("SECUREFILE_TICKET_{id}")], "t1cket");
    }

    #[test]
    fn variable_exclusion_flags() {
        let root = tempfile::tempdir().unwrap();
        let ctx = make_test_context(root.path());
        let variables = ctx.variables();
        variables.set("build.number", "42", false).unwrap();
        variables.set("agent.jobstatus", "Succeeded", false).unwrap();
        variables.set("deploy.key", "hunter2", true).unwrap();

        let mut handler = base(&ctx, Arc::new(RecordingStepHost::new(0)));
        handler.add_variables_to_environment(&ctx, true, true).unwrap();
        assert_eq!(handler.environment.get("agent.jobstatus").unwrap(), "Succeeded");
        assert!(!handler.environment.contains_key("build.number"));
        assert!(!handler.environment.contains_key("deploy.key"));
        assert!(!handler.environment.contains_key("VSTS_PUBLIC_VARIABLES"));

        let mut handler = base(&ctx, Arc::new(RecordingStepHost::new(0)));
        handler.add_variables_to_environment(&ctx, false, false).unwrap();
        assert_eq!(handler.environment.get("build.number").unwrap(), "42");
        assert_eq!(handler.environment.get("deploy.key").unwrap(), "hunter2");
        assert_eq!(handler.environment["VSTS_SECRET_VARIABLES"], r#"["deploy.key"]"#);
        assert!(handler.environment["VSTS_PUBLIC_VARIABLES"].contains("\"build.number\""));
    }

    #[test]
    fn prepend_path_goes_in_front_of_path() {
        use agent_sdk::path_util::PATH_SEPARATOR;

        let mut env = HashMap::new();
        env.insert(PATH_VARIABLE.to_string(), "/usr/bin".to_string());
        add_prepend_path_to_environment(&mut env, &["/tools/a".into(), "/tools/b".into()]);
        assert_eq!(
            env[PATH_VARIABLE],
            format!("/tools/b{PATH_SEPARATOR}/tools/a{PATH_SEPARATOR}/usr/bin")
        );

        let mut untouched = HashMap::new();
        add_prepend_path_to_environment(&mut untouched, &[]);
        assert!(untouched.is_empty());
    }

    #[tokio::test]
    async fn execute_routes_commands_and_plain_output() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let host = Arc::new(
            RecordingStepHost::new(0)
                .with_stdout(&["hello", "##vso[task.setvariable variable=answer]42"]),
        );
        let handler = base(&ctx, host.clone());

        let request = handler.exec_request(&ctx, "/w", "tool", "--flag", ProcessOptions::default());
        let outcome = handler.execute(&mut ctx, &request, None).await.unwrap();

        assert_eq!(outcome, ExecOutcome::Exited(0));
        assert_eq!(ctx.log_lines(), &["hello"]);
        assert_eq!(ctx.variables().get("answer").as_deref(), Some("42"));
        assert_eq!(host.last_request().arguments, "--flag");
    }

    #[test]
    fn launch_failures_become_infrastructure_errors() {
        let err = classify_exec_error(anyhow::anyhow!("No such file or directory"));
        assert!(HandlerError::classify(&err).unwrap().is_infrastructure());

        let exit = classify_exec_error(
            ProcessExitCodeError {
                exit_code: 2,
                file_name: "x".into(),
                arguments: String::new(),
            }
            .into(),
        );
        assert!(HandlerError::classify(&exit).is_none());
    }
}
