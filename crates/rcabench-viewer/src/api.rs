//! Client for the backend that serves result files as Arrow streams.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::{config::ApiConfig, error::TransportError};

/// Response header carrying the number of rows the stream will deliver.
pub const TOTAL_ROWS_HEADER: &str = "X-Total-Rows";

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An opened file stream.
pub struct FileStream {
    /// Announced row count, zero when unknown.
    pub total_rows: u64,
    pub body: ByteStream,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("total_rows", &self.total_rows)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataApi: Send + Sync {
    /// Open the Arrow stream of `file_path` belonging to resource
    /// `resource_id`.
    async fn fetch_file_stream(
        &self,
        resource_id: i64,
        file_path: String,
    ) -> Result<FileStream, TransportError>;
}

/// Absent or unparseable values count as unknown.
#[must_use]
pub fn parse_total_rows(value: Option<&str>) -> u64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct HttpDataApi {
    client: Client,
    base_url: String,
    file_endpoint: String,
    token: Option<String>,
}

impl HttpDataApi {
    #[must_use]
    pub fn new(config: &ApiConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    #[must_use]
    pub fn with_client(client: Client, config: &ApiConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            file_endpoint: config.file_endpoint.clone(),
            token: config.token.clone(),
        }
    }

    #[must_use]
    pub fn file_url(&self, resource_id: i64) -> String {
        let endpoint = self
            .file_endpoint
            .replace("{id}", &resource_id.to_string());
        format!("{}{endpoint}", self.base_url)
    }
}

fn request_error(error: &reqwest::Error) -> TransportError {
    TransportError::Request(error.to_string())
}

#[async_trait]
impl DataApi for HttpDataApi {
    async fn fetch_file_stream(
        &self,
        resource_id: i64,
        file_path: String,
    ) -> Result<FileStream, TransportError> {
        let url = self.file_url(resource_id);
        debug!("Requesting {url} path={file_path}");
        let mut request = self.client.get(&url).query(&[("path", &file_path)]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| request_error(&e))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Err(TransportError::MissingBody);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let total_rows = parse_total_rows(
            response
                .headers()
                .get(TOTAL_ROWS_HEADER)
                .and_then(|v| v.to_str().ok()),
        );
        let body = response
            .bytes_stream()
            .map_err(|e| request_error(&e))
            .boxed();
        Ok(FileStream { total_rows, body })
    }
}
