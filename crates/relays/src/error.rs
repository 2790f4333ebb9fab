use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("transport error after {attempts} attempts: {message}")]
    Transport { attempts: u32, message: String },

    #[error("relay returned {status}")]
    Http { status: StatusCode },

    #[error("undecodable relay response: {0}")]
    Decode(String),

    #[error("invalid relay url: {0}")]
    Url(String),
}
