// StepHost mapping `StepHost.cs`.
// Where a handler's process runs: straight on the agent host, or relayed into a
// running job container through `docker exec` with the request on stdin.

use agent_common::{HandlerError, HostContext, WellKnownDirectory};
use agent_sdk::{
    process_invoker::shell_split, ArgUtil, IOUtil, OutputEncoding, ProcessDataReceivedEventArgs, ProcessInvoker, ProcessOptions,
    StringUtil, TraceWriter,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::container::{ContainerInfo, DockerCommandManager};
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::add_prepend_path_to_environment;

/// File name of the relay script under the externals directory.
pub const CONTAINER_HANDLER_INVOKER: &str = "containerHandlerInvoker.js";

const CONTAINER_HANDLER_INVOKER_SOURCE: &str = include_str!("container_handler_invoker.js");

/// Stderr prefix the relay uses for its own failures. Must match `RELAY_ERROR`
/// in the relay script.
const RELAY_ERROR_PREFIX: &str = "##[relay-error]";

/// One process launch, as a handler describes it.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub working_directory: String,
    pub file_name: String,
    pub arguments: String,
    pub environment: HashMap<String, String>,
    /// Job prepend-path entries, oldest first. The host merges them into `PATH`.
    pub prepend_path: Vec<String>,
    pub options: ProcessOptions,
}

#[async_trait]
pub trait StepHost: Send + Sync {
    fn resolve_path_for_step_host(&self, path: &str) -> String;

    async fn determine_node_runtime_version(
        &self,
        context: &mut ExecutionContext,
        preferred_version: &str,
    ) -> Result<String>;

    async fn execute(
        &self,
        request: &ExecRequest,
        output: UnboundedSender<ProcessDataReceivedEventArgs>,
        cancellation_token: CancellationToken,
    ) -> Result<i32>;
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

pub struct DefaultStepHost {
    trace: Arc<dyn TraceWriter>,
}

impl DefaultStepHost {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl StepHost for DefaultStepHost {
    fn resolve_path_for_step_host(&self, path: &str) -> String {
        path.to_string()
    }

    async fn determine_node_runtime_version(
        &self,
        _context: &mut ExecutionContext,
        preferred_version: &str,
    ) -> Result<String> {
        Ok(preferred_version.to_string())
    }

    async fn execute(
        &self,
        request: &ExecRequest,
        output: UnboundedSender<ProcessDataReceivedEventArgs>,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        let mut environment = request.environment.clone();
        add_prepend_path_to_environment(&mut environment, &request.prepend_path);

        let invoker = ProcessInvoker::new(self.trace.clone());
        invoker
            .execute(
                &request.working_directory,
                &request.file_name,
                &request.arguments,
                Some(&environment),
                &request.options,
                output,
                cancellation_token,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

/// What the relay reads from stdin.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayPayload {
    handler: String,
    args: Vec<String>,
    work_dir: String,
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    prepend_path: String,
}

/// Runs every process in the job container. The environment and arguments
/// travel on stdin so nothing secret reaches the `docker exec` command line.
pub struct ContainerStepHost {
    host_context: Arc<HostContext>,
    container: Arc<RwLock<ContainerInfo>>,
    docker: Arc<DockerCommandManager>,
}

impl ContainerStepHost {
    pub fn new(
        host_context: Arc<HostContext>,
        container: Arc<RwLock<ContainerInfo>>,
        docker: Arc<DockerCommandManager>,
    ) -> Self {
        Self {
            host_context,
            container,
            docker,
        }
    }

    pub fn container(&self) -> &Arc<RwLock<ContainerInfo>> {
        &self.container
    }

    fn container_id(&self) -> Result<String, HandlerError> {
        let id = self.container.read().container_id.clone().unwrap_or_default();
        ArgUtil::not_null_or_empty(&id, "ContainerId")?;
        Ok(id)
    }

    /// Host path of the relay, written on first use.
    fn ensure_relay_script(&self) -> Result<PathBuf> {
        let externals = self.host_context.get_directory(WellKnownDirectory::Externals);
        let path = externals.join(CONTAINER_HANDLER_INVOKER);
        if !path.exists() {
            IOUtil::ensure_directory(&externals)?;
            std::fs::write(&path, CONTAINER_HANDLER_INVOKER_SOURCE)
                .with_context(|| format!("Failed to write '{}'", path.display()))?;
        }
        Ok(path)
    }

    fn build_payload(container: &ContainerInfo, request: &ExecRequest) -> RelayPayload {
        let environment = request
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), container.translate_to_container_path(v)))
            .collect();
        let prepend_path = request
            .prepend_path
            .iter()
            .rev()
            .map(|p| container.translate_to_container_path(p))
            .collect::<Vec<_>>()
            .join(":");

        RelayPayload {
            handler: request.file_name.clone(),
            args: shell_split(&request.arguments),
            work_dir: container.translate_to_container_path(&request.working_directory),
            environment,
            prepend_path,
        }
    }
}

#[async_trait]
impl StepHost for ContainerStepHost {
    /// Strip quotes and map into the container. Paths outside every mount fall
    /// back to the bare file name for the container's own `PATH` to resolve.
    fn resolve_path_for_step_host(&self, path: &str) -> String {
        let path = path.trim_matches('"');
        let container = self.container.read();
        if container.is_host_path_mapped(path) {
            container.translate_to_container_path(path)
        } else {
            Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string())
        }
    }

    async fn determine_node_runtime_version(
        &self,
        context: &mut ExecutionContext,
        preferred_version: &str,
    ) -> Result<String> {
        let container_id = self.container_id()?;
        let (exit_code, lines) = self
            .docker
            .docker_exec_capture(
                &container_id,
                "sh -c \"cat /etc/*release | grep ^ID\"",
                context.cancellation_token(),
            )
            .await?;

        if exit_code == 0 {
            for line in &lines {
                context.debug(line);
                if line.to_ascii_lowercase().contains("alpine") {
                    let node = format!("{preferred_version}_alpine");
                    context.debug(&format!(
                        "Container distribution is alpine. Running node handler with external tool: {node}"
                    ));
                    return Ok(node);
                }
            }
        }

        context.debug(&format!(
            "Running node handler with default external tool: {preferred_version}"
        ));
        Ok(preferred_version.to_string())
    }

    async fn execute(
        &self,
        request: &ExecRequest,
        output: UnboundedSender<ProcessDataReceivedEventArgs>,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        if request.options.standard_input.is_some() {
            return Err(HandlerError::NotSupported(
                "Standard input cannot be forwarded to a process running in a container.".into(),
            )
            .into());
        }

        let container_id = self.container_id()?;
        let relay = self.ensure_relay_script()?;

        let (payload, relay_in_container, node) = {
            let container = self.container.read();
            let payload = Self::build_payload(&container, request);
            let relay = container.translate_to_container_path(&relay.to_string_lossy());
            let node = container
                .container_node_path
                .clone()
                .unwrap_or_else(|| "node".to_string());
            (payload, relay, node)
        };

        let options = ProcessOptions {
            standard_input: Some(vec![StringUtil::convert_to_json_compact(&payload)?]),
            // node writes UTF-8 when it is not attached to a console.
            output_encoding: if cfg!(windows) {
                Some(OutputEncoding::Utf8)
            } else {
                None
            },
            ..request.options.clone()
        };

        // Relay failures are pulled out of the stream; everything else passes through.
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let exec_command = format!("{node} \"{relay_in_container}\"");
        let exec = self.docker.docker_exec(
            &container_id,
            "-i",
            &exec_command,
            &options,
            relay_tx,
            cancellation_token,
        );
        let forward = async move {
            let mut relay_error = None;
            while let Some(line) = relay_rx.recv().await {
                match line.data.strip_prefix(RELAY_ERROR_PREFIX) {
                    Some(message) => relay_error = Some(message.to_string()),
                    None => {
                        let _ = output.send(line);
                    }
                }
            }
            relay_error
        };
        let (result, relay_error) = tokio::join!(exec, forward);

        if let Some(message) = relay_error {
            return Err(HandlerError::infrastructure(format!(
                "The container step relay failed: {message}"
            ))
            .into());
        }

        result.map_err(|e| {
            if e.downcast_ref::<agent_sdk::ProcessExitCodeError>().is_some()
                || e.downcast_ref::<agent_sdk::ProcessCancelledError>().is_some()
            {
                e
            } else {
                anyhow::Error::new(HandlerError::infrastructure(format!(
                    "docker exec failed: {e:#}"
                )))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Records every request and replays canned output instead of spawning.
#[cfg(test)]
pub(crate) struct RecordingStepHost {
    pub requests: parking_lot::Mutex<Vec<ExecRequest>>,
    pub output: Vec<(agent_sdk::OutputStream, String)>,
    pub exit_code: i32,
    pub node_version_suffix: Option<&'static str>,
    /// Host prefix and the prefix it resolves to, like a container mount.
    pub path_mapping: Option<(String, String)>,
}

#[cfg(test)]
impl RecordingStepHost {
    pub fn new(exit_code: i32) -> Self {
        Self {
            requests: parking_lot::Mutex::new(Vec::new()),
            output: Vec::new(),
            exit_code,
            node_version_suffix: None,
            path_mapping: None,
        }
    }

    pub fn with_path_mapping(mut self, host: &str, mapped: &str) -> Self {
        self.path_mapping = Some((host.to_string(), mapped.to_string()));
        self
    }

    pub fn with_stdout(mut self, lines: &[&str]) -> Self {
        self.output.extend(
            lines
                .iter()
                .map(|l| (agent_sdk::OutputStream::Stdout, l.to_string())),
        );
        self
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.output.extend(
            lines
                .iter()
                .map(|l| (agent_sdk::OutputStream::Stderr, l.to_string())),
        );
        self
    }

    pub fn last_request(&self) -> ExecRequest {
        self.requests.lock().last().cloned().unwrap()
    }
}

#[cfg(test)]
#[async_trait]
impl StepHost for RecordingStepHost {
    fn resolve_path_for_step_host(&self, path: &str) -> String {
        match &self.path_mapping {
            Some((host, mapped)) if path.starts_with(host.as_str()) => {
                format!("{mapped}{}", &path[host.len()..])
            }
            _ => path.to_string(),
        }
    }

    async fn determine_node_runtime_version(
        &self,
        _context: &mut ExecutionContext,
        preferred_version: &str,
    ) -> Result<String> {
        Ok(match self.node_version_suffix {
            Some(suffix) => format!("{preferred_version}{suffix}"),
            None => preferred_version.to_string(),
        })
    }

    async fn execute(
        &self,
        request: &ExecRequest,
        output: UnboundedSender<ProcessDataReceivedEventArgs>,
        _cancellation_token: CancellationToken,
    ) -> Result<i32> {
        self.requests.lock().push(request.clone());
        for (stream, data) in &self.output {
            let _ = output.send(ProcessDataReceivedEventArgs {
                stream: *stream,
                data: data.clone(),
            });
        }
        if request.options.require_exit_code_zero && self.exit_code != 0 {
            return Err(agent_sdk::ProcessExitCodeError {
                exit_code: self.exit_code,
                file_name: request.file_name.clone(),
                arguments: request.arguments.clone(),
            }
            .into());
        }
        Ok(self.exit_code)
    }
}
