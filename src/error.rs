use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage quota exceeded writing {key} ({needed} bytes, {limit} allowed)")]
    QuotaExceeded { key: String, needed: usize, limit: usize },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store contents: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP {code}: {reason}")]
    Status { code: u16, reason: String },
    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid time value {value:?}")]
    Time { value: String },
}
