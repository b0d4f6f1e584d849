use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Error loading image: {0}")]
    ImageLoad(String),
    #[error("Error during detection: {0}")]
    Detection(String),
    #[error("Error rendering detections: {0}")]
    Rendering(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
