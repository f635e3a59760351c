use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::apis::SetLabelsRequest;
use crate::config::{expand_path, ConfigError, TlsFiles};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Master rejected report: {status} - {message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ReportClientTrait: Send + Sync {
    async fn set_labels(&self, request: &SetLabelsRequest) -> Result<(), ClientError>;
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

#[derive(Clone)]
pub struct ReportClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReportClient {
    pub fn new(base_url: impl Into<String>, tls: &TlsFiles) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));

        if tls.validate()? {
            let (Some(ca), Some(cert), Some(key)) = (&tls.ca_file, &tls.cert_file, &tls.key_file)
            else {
                return Err(ConfigError::PartialTls.into());
            };
            let ca = read(ca)?;
            let mut identity = read(cert)?;
            identity.extend(read(key)?);

            builder = builder
                .add_root_certificate(
                    reqwest::Certificate::from_pem(&ca).map_err(|e| ClientError::Tls(e.to_string()))?,
                )
                .identity(
                    reqwest::Identity::from_pem(&identity)
                        .map_err(|e| ClientError::Tls(e.to_string()))?,
                );
        }

        Ok(Self {
            client: builder.build().map_err(|e| ClientError::Http(e.to_string()))?,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ClientError> {
    let path = expand_path(path);
    std::fs::read(&path).map_err(|source| ConfigError::Io { path, source }.into())
}

#[async_trait]
impl ReportClientTrait for ReportClient {
    async fn set_labels(&self, request: &SetLabelsRequest) -> Result<(), ClientError> {
        let url = format!(
            "{}/v1/nodes/{}/labels",
            self.base_url.trim_end_matches('/'),
            request.node_name
        );
        debug!("Reporting {} labels to {}", request.labels.len(), url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tls_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let tls = TlsFiles {
            ca_file: Some(dir.path().join("ca.crt")),
            cert_file: Some(dir.path().join("tls.crt")),
            key_file: Some(dir.path().join("tls.key")),
        };
        let result = ReportClient::new("http://localhost:8080", &tls);
        assert!(matches!(result, Err(ClientError::Config(ConfigError::Io { .. }))));
    }

    #[test]
    fn test_plain_client_builds() {
        let client = ReportClient::new("http://localhost:8080/", &TlsFiles::default()).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080/");
    }
}
