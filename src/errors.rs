use std::io;

use reqwest::StatusCode;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("failed to persist state: {0}")]
    Persistence(String),
    #[error("{service} rate limit reached")]
    RateLimited { service: &'static str },
    #[error("{service} request failed ({status}): {message}")]
    Service {
        service: &'static str,
        status: String,
        message: String,
    },
}

impl AppError {
    /// True for upstream overload signals, whether the service reported it
    /// in its payload or as an HTTP 429.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            AppError::RateLimited { .. } => true,
            AppError::Http(err) => err.status() == Some(StatusCode::TOO_MANY_REQUESTS),
            _ => false,
        }
    }
}
