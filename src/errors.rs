use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decimal parse error: {0}")]
    Decimal(#[from] rust_decimal::Error),

    #[error("transport error: {code} - {message}")]
    Transport { code: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type PortalResult<T> = Result<T, PortalError>;
