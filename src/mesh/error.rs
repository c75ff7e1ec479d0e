use crate::config::ConfigError;
use crate::media::MediaError;
use crate::peer::TransportError;
use crate::registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("failed to acquire local media: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("registry failure: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("mesh coordinator has shut down")]
    Closed,
}
