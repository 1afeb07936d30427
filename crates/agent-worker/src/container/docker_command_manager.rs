// DockerCommandManager mapping `DockerCommandManager.cs`.
// Wraps the docker CLI calls a container action and the container step host need.

use agent_common::HostContext;
use agent_sdk::{
    IOUtil, ProcessDataReceivedEventArgs, ProcessInvoker, ProcessOptions, TraceWriter, WhichUtil,
};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command_manager::WorkerCommandManager;
use crate::container::container_info::ContainerInfo;
use crate::execution_context::ExecutionContext;
use crate::handlers::output_manager::pump_output;

/// Working directory docker runs the action with.
pub const CONTAINER_WORKSPACE: &str = "/github/workspace";

pub struct DockerCommandManager {
    docker_path: String,
    instance_label: String,
    trace: Arc<dyn TraceWriter>,
}

impl DockerCommandManager {
    /// Locate `docker` on the PATH. Missing docker is an error.
    pub fn new(host_context: &HostContext, root_directory: &str) -> Result<Self> {
        let docker_path = WhichUtil::which("docker", true)?
            .context("docker was not found on the PATH")?;
        Ok(Self::with_path(
            docker_path.to_string_lossy(),
            root_directory,
            host_context.get_trace_writer("DockerCommandManager"),
        ))
    }

    pub fn with_path(docker_path: impl Into<String>, root_directory: &str, trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            docker_path: docker_path.into(),
            instance_label: Self::instance_label(root_directory),
            trace,
        }
    }

    pub fn docker_path(&self) -> &str {
        &self.docker_path
    }

    /// First six hex digits of the root directory hash. Tags every image and
    /// container this agent creates.
    pub fn instance_label(root_directory: &str) -> String {
        IOUtil::get_path_hash(root_directory)[..6].to_string()
    }

    pub fn docker_instance_label(&self) -> &str {
        &self.instance_label
    }

    // -----------------------------------------------------------------------
    // Image operations
    // -----------------------------------------------------------------------

    pub async fn docker_pull(&self, context: &mut ExecutionContext, working_directory: &str, image: &str) -> Result<i32> {
        self.execute_docker_command(context, working_directory, "pull", image).await
    }

    pub async fn docker_build(
        &self,
        context: &mut ExecutionContext,
        working_directory: &str,
        docker_file_directory: &str,
        tag: &str,
    ) -> Result<i32> {
        let options = format!("-t {tag} \"{docker_file_directory}\"");
        self.execute_docker_command(context, working_directory, "build", &options)
            .await
    }

    // -----------------------------------------------------------------------
    // Container lifecycle
    // -----------------------------------------------------------------------

    /// `docker run` the container. Its environment goes through `env_file` so
    /// values never show up on the command line.
    pub async fn docker_run(
        &self,
        context: &mut ExecutionContext,
        working_directory: &str,
        container: &ContainerInfo,
        env_file: &Path,
    ) -> Result<i32> {
        let lines: Vec<String> = container
            .environment_variables
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(env_file, content)
            .with_context(|| format!("Failed to write '{}'", env_file.display()))?;

        let options = self.run_options(container, env_file);
        self.execute_docker_command(context, working_directory, "run", &options)
            .await
    }

    fn run_options(&self, container: &ContainerInfo, env_file: &Path) -> String {
        let mut options = vec![
            format!("--name {}", container.container_display_name),
            format!("--label {}", self.instance_label),
            format!("--workdir {CONTAINER_WORKSPACE}"),
            format!("--env-file \"{}\"", env_file.display()),
        ];
        if let Some(entry_point) = container.container_entry_point.as_deref().filter(|e| !e.is_empty()) {
            options.push(format!("--entrypoint \"{entry_point}\""));
        }
        if let Some(network) = container.container_network.as_deref().filter(|n| !n.is_empty()) {
            options.push(format!("--network {network}"));
        }
        options.extend(container.mount_volumes.iter().map(|v| v.to_docker_argument()));
        options.push(container.container_image.clone());
        if let Some(command) = container.container_command.as_deref() {
            options.push(command.to_string());
        }
        options.join(" ").trim().to_string()
    }

    /// `docker exec` with lines delivered to `output`, for the container step host.
    pub async fn docker_exec(
        &self,
        container_id: &str,
        options: &str,
        command: &str,
        process_options: &ProcessOptions,
        output: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        let arguments = format!("exec {options} {container_id} {command}");
        let invoker = ProcessInvoker::new(self.trace.clone());
        invoker
            .execute(
                "",
                &self.docker_path,
                arguments.trim(),
                None,
                process_options,
                output,
                cancellation_token,
            )
            .await
    }

    /// `docker exec` collecting stdout, for short probes inside a running container.
    pub async fn docker_exec_capture(
        &self,
        container_id: &str,
        command: &str,
        cancellation_token: CancellationToken,
    ) -> Result<(i32, Vec<String>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ProcessOptions::default();
        let exec = self.docker_exec(container_id, "", command, &options, tx, cancellation_token);

        let mut lines = Vec::new();
        let outcome = pump_output(exec, rx, None, |line| {
            if !line.data.is_empty() {
                lines.push(line.data);
            }
        })
        .await?;
        Ok((outcome.exit_code().unwrap_or(-1), lines))
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Run `docker <command> <options>`, streaming both pipes into the step.
    async fn execute_docker_command(
        &self,
        context: &mut ExecutionContext,
        working_directory: &str,
        command: &str,
        options: &str,
    ) -> Result<i32> {
        let arguments = format!("{command} {options}").trim().to_string();
        context.command(&format!("{} {}", self.docker_path, arguments));

        let (tx, rx) = mpsc::unbounded_channel();
        let invoker = ProcessInvoker::new(self.trace.clone());
        let process_options = ProcessOptions {
            require_exit_code_zero: false,
            kill_process_on_cancel: false,
            ..Default::default()
        };
        let exec = invoker.execute(
            working_directory,
            &self.docker_path,
            &arguments,
            None,
            &process_options,
            tx,
            context.cancellation_token(),
        );

        let commands = WorkerCommandManager::new();
        let outcome = pump_output(exec, rx, None, |line| {
            commands.process_output_line(context, &line.data);
        })
        .await
        .with_context(|| format!("docker {command} failed to run"))?;
        Ok(outcome.exit_code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::container_info::MountVolume;
    use agent_sdk::NullTraceWriter;

    fn manager(docker: &str) -> DockerCommandManager {
        DockerCommandManager::with_path(docker, "/agent", Arc::new(NullTraceWriter))
    }

    #[test]
    fn instance_label_is_stable_and_short() {
        let label = DockerCommandManager::instance_label("/agent");
        assert_eq!(label.len(), 6);
        assert_eq!(label, DockerCommandManager::instance_label("/agent"));
        assert_ne!(label, DockerCommandManager::instance_label("/other"));
        assert_eq!(manager("docker").docker_instance_label(), label);
    }

    #[test]
    fn run_options_follow_docker_order() {
        let mut container = ContainerInfo::new("alpine:3");
        container.container_display_name = "build_a1b2c3".into();
        container.container_entry_point = Some("/entry.sh".into());
        container.container_network = Some("vsts_network".into());
        container.container_command = Some("\"--flag\"".into());
        container
            .mount_volumes
            .push(MountVolume::new("/var/run/docker.sock", "/var/run/docker.sock", false));

        let mgr = manager("docker");
        let options = mgr.run_options(&container, Path::new("/tmp/.container_env"));
        assert_eq!(
            options,
            format!(
                "--name build_a1b2c3 --label {} --workdir /github/workspace --env-file \"/tmp/.container_env\" \
                 --entrypoint \"/entry.sh\" --network vsts_network \
                 -v \"/var/run/docker.sock\":\"/var/run/docker.sock\" alpine:3 \"--flag\"",
                mgr.docker_instance_label()
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commands_are_logged_and_output_routed() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let mut ctx = crate::execution_context::make_test_context(root.path());

        let fake = root.path().join("docker");
        std::fs::write(
            &fake,
            "#!/bin/sh\necho \"args: $*\"\necho '##vso[task.setvariable variable=pulled]yes'\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mgr = manager(&fake.to_string_lossy());
        let code = mgr.docker_pull(&mut ctx, "", "ubuntu:22.04").await.unwrap();

        assert_eq!(code, 3);
        assert!(ctx.log_lines()[0].starts_with("##[command]"));
        assert!(ctx.log_lines()[0].ends_with("pull ubuntu:22.04"));
        assert_eq!(ctx.log_lines()[1], "args: pull ubuntu:22.04");
        assert_eq!(ctx.variables().get("pulled").as_deref(), Some("yes"));
    }
}
