//! Concrete collaborators: registry discovery, the docker runtime and the
//! script extractor.

pub mod docker;
pub mod registry;
pub mod scripts;

pub use docker::DockerCli;
pub use registry::{RegistryAuth, RegistryDiscovery, RegistryEndpoint};
pub use scripts::ScriptExtractor;
