// NodeHandler mapping `NodeHandler.cs`.
// Runs a task's JavaScript entry point with the node runtime shipped in the
// agent's externals directory. Serves both the `Node` and `Node10` variants.

use agent_common::HandlerError;
use agent_sdk::ArgUtil;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::NodeHandlerData;

/// Externals folder name of the node runtime a handler runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRuntime {
    Node,
    Node10,
}

impl NodeRuntime {
    pub fn folder(self) -> &'static str {
        match self {
            NodeRuntime::Node => "node",
            NodeRuntime::Node10 => "node10",
        }
    }
}

pub struct NodeHandler {
    base: HandlerBase,
    data: NodeHandlerData,
    runtime: NodeRuntime,
}

impl NodeHandler {
    pub fn new(base: HandlerBase, data: NodeHandlerData, runtime: NodeRuntime) -> Self {
        Self {
            base,
            data,
            runtime,
        }
    }
}

#[async_trait]
impl Handler for NodeHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        self.base.trace.entering("NodeHandler::run_async");
        let variables = context.variables();

        self.base.add_inputs_to_environment();
        self.base.add_endpoints_to_environment(context)?;
        self.base.add_secure_files_to_environment(context);
        self.base.add_variables_to_environment(context, false, false)?;

        let target = self.base.resolve_task_path(&variables.expand_values(&self.data.target));
        ArgUtil::file_exists(&target, "Target").map_err(HandlerError::from)?;

        let working_directory = match variables.expand_values(&self.data.working_directory) {
            dir if !dir.is_empty() => dir,
            _ => variables.system_default_working_directory().unwrap_or_default(),
        };
        ArgUtil::directory_exists(Path::new(&working_directory), "workingDirectory")
            .map_err(HandlerError::from)?;

        self.base
            .run_node_script(
                context,
                self.runtime.folder(),
                &target,
                &working_directory,
            )
            .await
    }
}
