// NodeScriptActionHandler mapping `NodeScriptActionHandler.cs`.
// Runs a JavaScript action's entry point and lets the step finish as soon as the
// action marks itself complete, even if its process lingers.

use agent_common::HandlerError;
use agent_sdk::ArgUtil;
use anyhow::Result;
use async_trait::async_trait;

use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::NodeScriptActionHandlerData;

/// Runtime folder actions run on.
pub const ACTION_NODE_RUNTIME: &str = "node20";

pub struct NodeScriptActionHandler {
    base: HandlerBase,
    data: NodeScriptActionHandlerData,
}

impl NodeScriptActionHandler {
    pub fn new(base: HandlerBase, data: NodeScriptActionHandlerData) -> Self {
        Self { base, data }
    }
}

#[async_trait]
impl Handler for NodeScriptActionHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        let variables = context.variables();
        let target = self.base.resolve_task_path(&variables.expand_values(&self.data.target));
        ArgUtil::file_exists(&target, "Target").map_err(HandlerError::from)?;

        self.base.add_inputs_to_environment();
        self.base.add_endpoints_to_environment(context)?;
        self.base.add_secure_files_to_environment(context);
        self.base.add_variables_to_environment(context, false, false)?;
        let action_path = self.base.task_directory.to_string_lossy().into_owned();
        self.base
            .add_environment_variable("GITHUB_ACTION_PATH", Some(&action_path));

        let working_directory = variables.system_default_working_directory().unwrap_or_default();

        self.base
            .run_node_script(context, ACTION_NODE_RUNTIME, &target, &working_directory)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::make_test_context;
    use crate::handlers::handler::node_executable;
    use crate::handlers::step_host::{DefaultStepHost, RecordingStepHost, StepHost};
    use agent_common::WellKnownDirectory;
    use std::collections::{BTreeMap, HashMap};
    use std::path::Path;
    use std::sync::Arc;

    fn handler(ctx: &ExecutionContext, host: Arc<dyn StepHost>, action_dir: &Path) -> NodeScriptActionHandler {
        let base = HandlerBase::new(
            Arc::clone(ctx.host_context()),
            "NodeScriptActionHandler",
            host,
            BTreeMap::from([("who-to-greet".to_string(), "octo".to_string())]),
            HashMap::new(),
            action_dir.to_path_buf(),
        );
        NodeScriptActionHandler::new(
            base,
            NodeScriptActionHandlerData {
                target: "main.js".into(),
            },
        )
    }

    #[tokio::test]
    async fn runs_the_action_entry_point() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        std::fs::write(root.path().join("main.js"), "// action").unwrap();
        let host = Arc::new(RecordingStepHost::new(0));
        let mut handler = handler(&ctx, host.clone(), root.path());

        handler.run_async(&mut ctx).await.unwrap();

        let request = host.last_request();
        assert!(request.file_name.contains(ACTION_NODE_RUNTIME));
        assert!(request.arguments.ends_with("main.js\""));
        assert_eq!(request.environment["INPUT_WHO-TO-GREET"], "octo");
        assert_eq!(
            request.environment["GITHUB_ACTION_PATH"],
            root.path().to_string_lossy()
        );
        assert!(ctx
            .log_lines()
            .contains(&format!("##[command]{} {}", request.file_name, request.arguments)));
    }

    #[tokio::test]
    async fn exit_code_fails_the_action() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        std::fs::write(root.path().join("main.js"), "// action").unwrap();
        let mut handler = handler(&ctx, Arc::new(RecordingStepHost::new(1)), root.path());

        let err = handler.run_async(&mut ctx).await.unwrap_err();
        assert!(matches!(HandlerError::classify(&err), Some(HandlerError::Task(_))));
    }

    /// Stands in for the node runtime: reports completion, then hangs.
    #[cfg(unix)]
    #[tokio::test]
    async fn force_complete_wins_over_a_lingering_process() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::{Duration, Instant};

        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        std::fs::write(root.path().join("main.js"), "// action").unwrap();

        let externals = ctx.host_context().get_directory(WellKnownDirectory::Externals);
        let node = node_executable(&externals, ACTION_NODE_RUNTIME);
        std::fs::create_dir_all(node.parent().unwrap()).unwrap();
        std::fs::write(
            &node,
            "#!/bin/sh\necho '##vso[task.complete result=Succeeded]done'\nsleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o755)).unwrap();

        let host = Arc::new(DefaultStepHost::new(Arc::new(agent_sdk::NullTraceWriter)));
        let mut handler = handler(&ctx, host, root.path());

        let started = Instant::now();
        handler.run_async(&mut ctx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(ctx.result(), Some(agent_common::TaskResult::Succeeded));
    }
}
