use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("url must start with http:// or https://")]
    InvalidUrl,
    #[error("invalid `{field}`: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
}

impl DomainError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}
