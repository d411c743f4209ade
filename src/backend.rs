use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::FetchError;

/// Anything that can answer a chart query with JSON rows.
pub trait RowSource: Send + Sync + 'static {
    fn fetch_rows(&self, url: &str, params: &[(String, String)]) -> Result<Vec<Value>, FetchError>;
}

/// HTTP client for PostgREST and the internal metrics API.
pub struct Backend {
    client: Client,
}

impl Backend {
    /// `timeout` of `None` lets requests run as long as the server takes.
    pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<T, FetchError> {
        debug!("GET {url} {params:?}");
        let response = self.client.get(url).query(params).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            });
        }
        let body = response.text()?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl RowSource for Backend {
    fn fetch_rows(&self, url: &str, params: &[(String, String)]) -> Result<Vec<Value>, FetchError> {
        // A `null` body is treated as no rows.
        let rows: Option<Vec<Value>> = self.get_json(url, params)?;
        Ok(rows.unwrap_or_default())
    }
}
