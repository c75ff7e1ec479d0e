use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry rejected request with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("registry unavailable: {message}")]
    Unavailable { message: String },
}
