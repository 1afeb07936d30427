// ContainerActionHandler mapping `ContainerActionPlugin.cs`.
// Builds or pulls an action's image and runs it once with the workspace mounted
// at `/github/workspace`.

use agent_common::{HandlerError, WellKnownDirectory};
use agent_sdk::{ArgUtil, IOUtil, RepositoryResource, StringUtil};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::container::docker_command_manager::CONTAINER_WORKSPACE;
use crate::container::{ContainerInfo, DockerCommandManager, MountVolume};
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{Handler, HandlerBase, HandlerOutcome};
use crate::handlers::handler_data::ContainerActionHandlerData;

const DOCKER_IMAGE_PREFIX: &str = "docker://";

/// `owner/repo[/path]@ref`, an action that lives in a source repository.
fn is_repository_reference(target: &str) -> bool {
    match target.split_once('@') {
        Some((repo, reference)) => {
            !reference.is_empty() && repo.split('/').filter(|s| !s.is_empty()).count() >= 2
        }
        None => false,
    }
}
const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const CONTAINER_HOME: &str = "/github/home";
const CONTAINER_WORKFLOW: &str = "/github/workflow";
const CONTAINER_ALIAS: &str = "action";
const PULL_ATTEMPTS: u32 = 3;

/// Entrypoint override and command for `docker run`, from the `runs` and `args`
/// inputs. Both accept a JSON array or a plain string.
pub fn docker_command(runs: &str, args: &str) -> Result<(String, String), HandlerError> {
    let mut entry_point = String::new();
    let mut command = String::new();

    let runs = runs.trim();
    if !runs.is_empty() {
        if is_json_array(runs) {
            let segments = parse_json_array(runs)?;
            if let Some((first, rest)) = segments.split_first() {
                entry_point = first.clone();
                for segment in rest {
                    command.push_str(&format!(" {}", quote_segment(segment)));
                }
            }
        } else {
            match runs.find(' ') {
                Some(index) if index > 0 => {
                    entry_point = runs[..index].to_string();
                    command.push_str(&format!(" {}", &runs[index..]));
                }
                _ => entry_point = runs.to_string(),
            }
        }
    }

    let args = args.trim();
    if !args.is_empty() {
        if is_json_array(args) {
            let segments = parse_json_array(args)?;
            if !segments.is_empty() {
                let quoted: Vec<String> = segments.iter().map(|s| quote_segment(s)).collect();
                command.push_str(&format!(" {}", quoted.join(" ")));
            }
        } else {
            command.push_str(&format!(" {args}"));
        }
    }

    Ok((entry_point.trim().to_string(), command.trim().to_string()))
}

fn is_json_array(value: &str) -> bool {
    value.starts_with('[') && value.ends_with(']')
}

fn parse_json_array(value: &str) -> Result<Vec<String>, HandlerError> {
    StringUtil::convert_from_json::<Vec<String>>(value).map_err(|e| {
        HandlerError::task(format!("Input '{value}' is not a valid JSON array. {e}"))
    })
}

fn quote_segment(segment: &str) -> String {
    format!("\"{}\"", segment.replace('\\', "\\\\").replace('"', "\\\""))
}

pub struct ContainerActionHandler {
    base: HandlerBase,
    data: ContainerActionHandlerData,
    docker: Option<DockerCommandManager>,
}

impl ContainerActionHandler {
    pub fn new(base: HandlerBase, data: ContainerActionHandlerData) -> Self {
        Self {
            base,
            data,
            docker: None,
        }
    }

    /// Use `docker` instead of the one found on the `PATH`.
    pub fn with_docker(mut self, docker: DockerCommandManager) -> Self {
        self.docker = Some(docker);
        self
    }

    /// `docker pull`, retried with a random back-off.
    async fn pull_image(
        docker: &DockerCommandManager,
        context: &mut ExecutionContext,
        working_directory: &str,
        image: &str,
    ) -> Result<()> {
        let mut exit_code = 0;
        for attempt in 1..=PULL_ATTEMPTS {
            exit_code = docker.docker_pull(context, working_directory, image).await?;
            if exit_code == 0 {
                return Ok(());
            }
            if attempt < PULL_ATTEMPTS {
                let back_off =
                    Duration::from_millis(rand::thread_rng().gen_range(1_000..=10_000));
                context.warning(&format!(
                    "Docker pull failed with exit code {exit_code}, back off {} seconds before retry.",
                    back_off.as_secs_f64()
                ));
                tokio::time::sleep(back_off).await;
            }
        }
        Err(HandlerError::infrastructure(format!(
            "Docker pull failed with exit code {exit_code}"
        ))
        .into())
    }

    fn build_container(
        &self,
        context: &mut ExecutionContext,
        image: String,
        temp_directory: &Path,
    ) -> Result<ContainerInfo> {
        let variables = context.variables();
        let default_working_directory = variables
            .system_default_working_directory()
            .unwrap_or_default();
        ArgUtil::not_null_or_empty(&default_working_directory, "system.defaultWorkingDirectory")
            .map_err(HandlerError::from)?;

        let (entry_point, command) = docker_command(
            self.base.get_input("runs").unwrap_or_default(),
            self.base.get_input("args").unwrap_or_default(),
        )?;
        context.debug(&format!("Container ENTRYPOINT override: '{entry_point}'"));
        context.debug(&format!("Container CMD override: '{command}'"));

        let home = temp_directory.join("_github_home");
        let workflow = temp_directory.join("_github_workflow");
        IOUtil::ensure_directory(&home)?;
        IOUtil::ensure_directory(&workflow)?;
        let home = home.to_string_lossy().into_owned();
        let workflow = workflow.to_string_lossy().into_owned();

        let mut container = ContainerInfo::new(image);
        container.container_name = CONTAINER_ALIAS.to_string();
        container.container_display_name = format!(
            "{CONTAINER_ALIAS}_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );
        container.container_entry_point = Some(entry_point);
        container.container_command = Some(command);
        container.container_network = variables.agent_container_network();

        container.add_path_mapping(default_working_directory.clone(), CONTAINER_WORKSPACE);
        container.add_path_mapping(home.clone(), CONTAINER_HOME);
        container.add_path_mapping(workflow.clone(), CONTAINER_WORKFLOW);
        container.mount_volumes = vec![
            MountVolume::new(DOCKER_SOCKET, DOCKER_SOCKET, false),
            MountVolume::new(home, CONTAINER_HOME, false),
            MountVolume::new(workflow, CONTAINER_WORKFLOW, false),
            MountVolume::new(default_working_directory, CONTAINER_WORKSPACE, false),
        ];

        let repositories = context.repositories();
        let self_repo = repositories
            .iter()
            .find(|r| r.alias.eq_ignore_ascii_case(RepositoryResource::SELF_ALIAS));
        let repo_property = |name: &str| {
            self_repo
                .and_then(|r| r.property(name))
                .unwrap_or_default()
                .to_string()
        };
        let env = &mut container.environment_variables;
        env.insert(
            "GITHUB_ACTOR".into(),
            self_repo.and_then(|r| r.author()).unwrap_or_default().to_string(),
        );
        env.insert("GITHUB_REPOSITORY".into(), repo_property("name"));
        env.insert("GITHUB_WORKSPACE".into(), CONTAINER_WORKSPACE.into());
        env.insert(
            "GITHUB_SHA".into(),
            self_repo.map(|r| r.version.clone()).unwrap_or_default(),
        );
        env.insert("GITHUB_REF".into(), repo_property("ref"));
        env.insert(
            "GITHUB_TOKEN".into(),
            variables.system_access_token().unwrap_or_default(),
        );
        env.insert(
            "GITHUB_WORKFLOW".into(),
            variables.build_definition_name().unwrap_or_default(),
        );
        env.insert(
            "GITHUB_EVENT_NAME".into(),
            variables.get("build.reason").unwrap_or_default(),
        );
        env.insert(
            "GITHUB_EVENT_PATH".into(),
            format!("{CONTAINER_WORKFLOW}/event.json"),
        );
        env.insert("HOME".into(), CONTAINER_HOME.into());
        Ok(container)
    }
}

#[async_trait]
impl Handler for ContainerActionHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    async fn run_async(&mut self, context: &mut ExecutionContext) -> Result<HandlerOutcome> {
        let host_context = std::sync::Arc::clone(self.base.host_context());
        let root = host_context.get_directory(WellKnownDirectory::Root);
        let docker = match self.docker.take() {
            Some(docker) => docker,
            None => DockerCommandManager::new(&host_context, &root.to_string_lossy())
                .map_err(|e| HandlerError::infrastructure(format!("{e:#}")))?,
        };
        let work_directory = host_context
            .get_directory(WellKnownDirectory::Work)
            .to_string_lossy()
            .into_owned();
        let temp_directory = context
            .variables()
            .agent_temp_directory()
            .map(PathBuf::from)
            .unwrap_or_else(|| host_context.get_directory(WellKnownDirectory::Temp));
        IOUtil::ensure_directory(&temp_directory)?;

        let target = context.variables().expand_values(&self.data.target);
        let image = match self
            .data
            .container_image
            .as_deref()
            .map(str::trim)
            .filter(|i| !i.is_empty())
        {
            Some(image) => Some(image.to_string()),
            None => target.strip_prefix(DOCKER_IMAGE_PREFIX).map(str::to_string),
        };

        let image = match image {
            Some(image) => {
                let image = image
                    .strip_prefix(DOCKER_IMAGE_PREFIX)
                    .unwrap_or(&image)
                    .to_string();
                Self::pull_image(&docker, context, &work_directory, &image).await?;
                image
            }
            None if is_repository_reference(&target) => {
                return Err(HandlerError::NotSupported(format!(
                    "Container action '{target}' refers to a repository. Use a Dockerfile path or a '{DOCKER_IMAGE_PREFIX}' image."
                ))
                .into());
            }
            None => {
                let docker_file = self.base.resolve_task_path(&target);
                ArgUtil::file_exists(&docker_file, "Dockerfile").map_err(HandlerError::from)?;
                context.output(&format!("Dockerfile for action: '{}'.", docker_file.display()));

                let tag = format!(
                    "{}:{}",
                    docker.docker_instance_label(),
                    context.id().simple()
                );
                let build_directory = docker_file.parent().unwrap_or(Path::new("."));
                let exit_code = docker
                    .docker_build(
                        context,
                        &work_directory,
                        &build_directory.to_string_lossy(),
                        &tag,
                    )
                    .await?;
                if exit_code != 0 {
                    return Err(HandlerError::infrastructure(format!(
                        "Docker build failed with exit code {exit_code}"
                    ))
                    .into());
                }
                tag
            }
        };

        let container = self.build_container(context, image, &temp_directory)?;
        let env_file = temp_directory.join(".container_env");
        let exit_code = docker
            .docker_run(context, &work_directory, &container, &env_file)
            .await?;
        self.docker = Some(docker);
        if exit_code != 0 {
            return Err(HandlerError::infrastructure(format!(
                "Docker run failed with exit code {exit_code}"
            ))
            .into());
        }
        Ok(HandlerOutcome::default())
    }
}
