// ContainerInfo mapping `ContainerInfo.cs`.
// Describes a container a step runs in: image, mounts, environment and the
// host/container path translation used by the container step host.

use agent_sdk::io_util::IOUtil;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `-v` mount. A mount without a source is an anonymous volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountVolume {
    #[serde(default)]
    pub source_volume_path: Option<String>,
    pub target_volume_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl MountVolume {
    pub fn new(
        source_volume_path: impl Into<String>,
        target_volume_path: impl Into<String>,
        read_only: bool,
    ) -> Self {
        let source = source_volume_path.into();
        Self {
            source_volume_path: if source.is_empty() { None } else { Some(source) },
            target_volume_path: target_volume_path.into(),
            read_only,
        }
    }

    /// Accepts `source:target:ro`, `source:target`, `target:ro` and `target`.
    pub fn parse(spec: &str) -> Self {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [source, target, mode] => Self::new(*source, *target, mode.eq_ignore_ascii_case("ro")),
            [target, mode] if mode.eq_ignore_ascii_case("ro") => Self::new("", *target, true),
            [source, target] => Self::new(*source, *target, false),
            _ => Self::new("", spec, false),
        }
    }

    /// The `-v` argument, quoted for the docker command line.
    pub fn to_docker_argument(&self) -> String {
        let escape = |p: &str| p.replace('"', "\\\"");
        let mut argument = match &self.source_volume_path {
            Some(source) => format!(
                "-v \"{}\":\"{}\"",
                escape(source),
                escape(&self.target_volume_path)
            ),
            None => format!("-v \"{}\"", escape(&self.target_volume_path)),
        };
        if self.read_only {
            argument.push_str(":ro");
        }
        argument
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PathMapping {
    host_path: String,
    container_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    /// Set once the container engine has created the container.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub container_display_name: String,
    pub container_image: String,
    #[serde(default)]
    pub container_entry_point: Option<String>,
    /// Everything after the image on the `docker run` line.
    #[serde(default)]
    pub container_command: Option<String>,
    #[serde(default)]
    pub container_network: Option<String>,
    #[serde(default)]
    pub container_work_directory: Option<String>,
    /// Node binary to run the stdin relay with. Defaults to `node` on the container's PATH.
    #[serde(default)]
    pub container_node_path: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub mount_volumes: Vec<MountVolume>,
    #[serde(skip)]
    path_mappings: Vec<PathMapping>,
}

impl ContainerInfo {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            container_image: image.into(),
            ..Default::default()
        }
    }

    /// Register a host to container prefix. Later mappings win over earlier ones.
    pub fn add_path_mapping(&mut self, host_path: impl Into<String>, container_path: impl Into<String>) {
        self.path_mappings.insert(
            0,
            PathMapping {
                host_path: host_path.into(),
                container_path: container_path.into(),
            },
        );
    }

    pub fn path_mappings(&self) -> Vec<(String, String)> {
        self.path_mappings
            .iter()
            .map(|m| (m.host_path.clone(), m.container_path.clone()))
            .collect()
    }

    /// Host path falls under a mapping or a mount with a source.
    pub fn is_host_path_mapped(&self, path: &str) -> bool {
        self.host_prefixes().any(|(host, _)| is_under(path, host))
    }

    pub fn translate_to_container_path(&self, path: &str) -> String {
        for (host, container) in self.host_prefixes() {
            if is_under(path, host) {
                return rebase(path, host, container);
            }
        }
        path.to_string()
    }

    pub fn translate_to_host_path(&self, path: &str) -> String {
        for (host, container) in self.host_prefixes() {
            if is_under(path, container) {
                return rebase(path, container, host);
            }
        }
        path.to_string()
    }

    fn host_prefixes(&self) -> impl Iterator<Item = (&str, &str)> {
        let mappings = self
            .path_mappings
            .iter()
            .map(|m| (m.host_path.as_str(), m.container_path.as_str()));
        let mounts = self.mount_volumes.iter().filter_map(|m| {
            m.source_volume_path
                .as_deref()
                .map(|source| (source, m.target_volume_path.as_str()))
        });
        mappings.chain(mounts)
    }
}

/// `path` is `prefix` itself or sits below it on a separator boundary.
fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches(['/', '\\']);
    if prefix.is_empty() || !IOUtil::path_starts_with(path, prefix) {
        return false;
    }
    match path[prefix.len()..].chars().next() {
        None => true,
        Some(c) => c == '/' || c == '\\',
    }
}

fn rebase(path: &str, from: &str, to: &str) -> String {
    let from = from.trim_end_matches(['/', '\\']);
    let to = to.trim_end_matches(['/', '\\']);
    let rest = &path[from.len()..];
    if to.starts_with('/') {
        // Container paths are always POSIX.
        format!("{}{}", to, rest.replace('\\', "/"))
    } else {
        format!("{to}{rest}")
    }
}
