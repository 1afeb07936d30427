// HandlerFactory mapping `HandlerFactory.cs`.
// Turns a step's handler data into the strategy that runs it.

use agent_sdk::VariableValue;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::execution_context::ExecutionContext;
use crate::handlers::agent_plugin_handler::AgentPluginHandler;
use crate::handlers::container_action_handler::ContainerActionHandler;
use crate::handlers::handler::{Handler, HandlerBase};
use crate::handlers::handler_data::HandlerData;
use crate::handlers::legacy_powershell_handler::{LegacyHostFlavor, LegacyPowerShellHandler};
use crate::handlers::node_handler::{NodeHandler, NodeRuntime};
use crate::handlers::node_script_action_handler::NodeScriptActionHandler;
use crate::handlers::powershell3_handler::PowerShell3Handler;
use crate::handlers::powershell_exe_handler::PowerShellExeHandler;
use crate::handlers::process_handler::ProcessHandler;
use crate::handlers::script_handler::ScriptHandler;
use crate::handlers::step_host::StepHost;

/// Everything about a step the factory needs besides its handler data.
pub struct StepSpec {
    pub inputs: BTreeMap<String, String>,
    /// Step-level environment. Wins over the job's scoped environment.
    pub environment: HashMap<String, String>,
    /// Runtime variables scoped to this task, handed to plugins.
    pub task_variables: BTreeMap<String, VariableValue>,
    pub task_directory: PathBuf,
}

pub struct HandlerFactory;

impl HandlerFactory {
    pub fn create(
        context: &ExecutionContext,
        step_host: Arc<dyn StepHost>,
        data: HandlerData,
        step: StepSpec,
    ) -> Box<dyn Handler> {
        let mut environment: HashMap<String, String> =
            context.job_environment().into_iter().collect();
        environment.extend(step.environment);

        let trace_name = format!("{}Handler", data.kind());
        let base = HandlerBase::new(
            Arc::clone(context.host_context()),
            &trace_name,
            step_host,
            step.inputs,
            environment,
            step.task_directory,
        );

        match data {
            HandlerData::Process(data) => Box::new(ProcessHandler::new(base, data)),
            HandlerData::Script(data) => Box::new(ScriptHandler::new(base, data)),
            HandlerData::Node(data) => Box::new(NodeHandler::new(base, data, NodeRuntime::Node)),
            HandlerData::Node10(data) => {
                Box::new(NodeHandler::new(base, data, NodeRuntime::Node10))
            }
            HandlerData::PowerShell(data) => Box::new(LegacyPowerShellHandler::new(
                base,
                data,
                LegacyHostFlavor::PowerShell,
            )),
            HandlerData::AzurePowerShell(data) => Box::new(LegacyPowerShellHandler::new(
                base,
                data,
                LegacyHostFlavor::AzurePowerShell,
            )),
            HandlerData::PowerShell3(data) => Box::new(PowerShell3Handler::new(base, data)),
            HandlerData::PowerShellExe(data) => Box::new(PowerShellExeHandler::new(base, data)),
            HandlerData::AgentPlugin(data) => {
                Box::new(AgentPluginHandler::new(base, data, step.task_variables))
            }
            HandlerData::ContainerAction(data) => {
                Box::new(ContainerActionHandler::new(base, data))
            }
            HandlerData::NodeScriptAction(data) => {
                Box::new(NodeScriptActionHandler::new(base, data))
            }
        }
    }
}
