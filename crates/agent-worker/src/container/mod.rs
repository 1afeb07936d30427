// Container support: the container descriptor and the docker CLI wrapper.

pub mod container_info;
pub mod docker_command_manager;

pub use container_info::{ContainerInfo, MountVolume};
pub use docker_command_manager::DockerCommandManager;
