// WorkerCommandManager mapping `WorkerCommandManager.cs`.
// Recognizes `##vso[area.event ...]` lines in process output and routes them to
// the extension registered for the area.

use agent_common::Command;
use anyhow::Result;
use std::collections::HashMap;

use crate::execution_context::ExecutionContext;
use crate::task_commands::TaskCommandExtension;

/// Handles every event of one command area.
pub trait WorkerCommandExtension: Send + Sync {
    fn command_area(&self) -> &'static str;

    fn process_command(&self, context: &mut ExecutionContext, command: &Command) -> Result<()>;
}

pub struct WorkerCommandManager {
    /// Keyed by lowercase area.
    extensions: HashMap<String, Box<dyn WorkerCommandExtension>>,
}

impl WorkerCommandManager {
    /// A manager with the built-in `task` extension registered.
    pub fn new() -> Self {
        let mut manager = Self::empty();
        manager.register(Box::new(TaskCommandExtension));
        manager
    }

    pub fn empty() -> Self {
        Self {
            extensions: HashMap::new(),
        }
    }

    pub fn register(&mut self, extension: Box<dyn WorkerCommandExtension>) {
        self.extensions
            .insert(extension.command_area().to_ascii_lowercase(), extension);
    }

    /// Returns `true` when `input` was a command for a known area.
    ///
    /// A failing command is logged as a step error and still counts as handled.
    pub fn try_process_command(&self, context: &mut ExecutionContext, input: &str) -> bool {
        let Some(command) = Command::try_parse(input) else {
            return false;
        };
        let Some(extension) = self.extensions.get(&command.area.to_ascii_lowercase()) else {
            return false;
        };

        if let Err(e) = extension.process_command(context, &command) {
            context.error(&format!("Unable to process command '{input}' successfully. Please reference documentation (http://go.microsoft.com/fwlink/?LinkId=817296)"));
            context.error(&format!("{e:#}"));
        } else {
            context.debug(&format!("Processed: {input}"));
        }
        true
    }

    /// Offer the line to the interpreter, falling back to plain output.
    pub fn process_output_line(&self, context: &mut ExecutionContext, line: &str) {
        if !self.try_process_command(context, line) {
            context.output(line);
        }
    }
}

impl Default for WorkerCommandManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::make_test_context;
    use agent_common::TaskResult;

    struct FailingExtension;

    impl WorkerCommandExtension for FailingExtension {
        fn command_area(&self) -> &'static str {
            "Broken"
        }

        fn process_command(&self, _: &mut ExecutionContext, _: &Command) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn recognized_commands_are_not_echoed() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let manager = WorkerCommandManager::new();

        manager.process_output_line(&mut ctx, "##vso[task.setvariable variable=color]blue");
        manager.process_output_line(&mut ctx, "##vso[task.complete result=SucceededWithIssues]done");

        assert!(ctx.log_lines().is_empty());
        assert_eq!(ctx.variables().get("color").as_deref(), Some("blue"));
        assert_eq!(ctx.result(), Some(TaskResult::SucceededWithIssues));
    }

    #[test]
    fn plain_and_unknown_area_lines_pass_through() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let manager = WorkerCommandManager::new();

        manager.process_output_line(&mut ctx, "hello world");
        manager.process_output_line(&mut ctx, "##vso[artifact.upload]file");
        manager.process_output_line(&mut ctx, "##vso[task.setvariable variable=x");

        assert_eq!(
            ctx.log_lines(),
            &["hello world", "##vso[artifact.upload]file", "##vso[task.setvariable variable=x"]
        );
    }

    #[test]
    fn extension_errors_become_step_errors() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = make_test_context(root.path());
        let mut manager = WorkerCommandManager::empty();
        manager.register(Box::new(FailingExtension));

        assert!(manager.try_process_command(&mut ctx, "##vso[broken.thing]x"));
        assert_eq!(ctx.error_count(), 2);
        assert_eq!(ctx.log_lines().last().unwrap(), "##[error]boom");
    }
}
