// AgentPluginHandler mapping `AgentPluginHandler.cs` and `AgentPluginManager.cs`.
// Runs a built-in task plugin out of process through `Agent.PluginHost`, which
// reads the plugin's execution context from stdin.

use agent_common::{HandlerError, WellKnownDirectory};
use agent_sdk::{
    AgentTaskPluginExecutionContext, OutputEncoding, ProcessOptions, StringUtil, VariableValue,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::AgentPluginHandlerData;
use crate::handlers::step_host::{DefaultStepHost, StepHost};

/// Plugins this agent ships with. Nothing else is loaded.
pub const SUPPORTED_TASK_PLUGINS: &[&str] = &[
    "Agent.Plugins.Repository.CheckoutTask, Agent.Plugins",
    "Agent.Plugins.Repository.CleanupTask, Agent.Plugins",
    "Agent.Plugins.PipelineArtifact.DownloadPipelineArtifactTask, Agent.Plugins",
    "Agent.Plugins.PipelineArtifact.PublishPipelineArtifactTask, Agent.Plugins",
    "Agent.Plugins.Container.ContainerActionTask, Agent.Plugins",
];

pub fn plugin_host_path(bin_directory: &std::path::Path) -> PathBuf {
    let file = if cfg!(windows) {
        "Agent.PluginHost.exe"
    } else {
        "Agent.PluginHost"
    };
    bin_directory.join(file)
}

pub struct AgentPluginHandler {
    base: HandlerBase,
    data: AgentPluginHandlerData,
    task_variables: BTreeMap<String, VariableValue>,
    /// The plugin host always runs on the agent machine.
    plugin_host: Arc<dyn StepHost>,
}

impl AgentPluginHandler {
    pub fn new(
        base: HandlerBase,
        data: AgentPluginHandlerData,
        task_variables: BTreeMap<String, VariableValue>,
    ) -> Self {
        let plugin_host = Arc::new(DefaultStepHost::new(
            base.host_context().get_trace_writer("AgentPluginManager"),
        ));
        Self {
            base,
            data,
            task_variables,
            plugin_host,
        }
    }

    #[cfg(test)]
    fn with_plugin_host(mut self, plugin_host: Arc<dyn StepHost>) -> Self {
        self.plugin_host = plugin_host;
        self
    }

    fn plugin_context(&self, context: &ExecutionContext) -> AgentTaskPluginExecutionContext {
        AgentTaskPluginExecutionContext {
            inputs: self.base.inputs.clone(),
            repositories: context.repositories(),
            endpoints: context.endpoints(),
            variables: context.variables().to_plugin_variables(),
            task_variables: self.task_variables.clone(),
        }
    }
}

#[async_trait]
impl Handler for AgentPluginHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        let plugin = self.data.target.trim();
        if !SUPPORTED_TASK_PLUGINS.contains(&plugin) {
            return Err(HandlerError::NotSupported(format!(
                "Task plugin '{plugin}' is not supported by this agent."
            ))
            .into());
        }

        let payload = StringUtil::convert_to_json_compact(&self.plugin_context(context))?;
        let host_context = Arc::clone(self.base.host_context());
        let plugin_host = plugin_host_path(&host_context.get_directory(WellKnownDirectory::Bin));
        let work_directory = host_context.get_directory(WellKnownDirectory::Work);
        let arguments = format!("task \"{plugin}\"");
        context.command(&format!("{} {arguments}", plugin_host.display()));

        let options = ProcessOptions {
            require_exit_code_zero: true,
            output_encoding: Some(OutputEncoding::Utf8),
            kill_process_on_cancel: false,
            standard_input: Some(vec![payload]),
            ..Default::default()
        };
        let mut request = self.base.exec_request(
            context,
            &work_directory.to_string_lossy(),
            &plugin_host.to_string_lossy(),
            &arguments,
            options,
        );
        // The plugin host resolves its own tools; it does not see the job's PATH changes.
        request.prepend_path.clear();

        let commands = Arc::clone(&self.base.commands);
        HandlerBase::execute_on(self.plugin_host.as_ref(), context, &request, None, |ctx, line| {
            commands.process_output_line(ctx, &line.data)
        })
        .await?;
        Ok(HandlerOutcome::default())
    }
}
