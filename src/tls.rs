//! mTLS material for the scheduler/worker stream.
//!
//! Scheduler and workers share one CA. The scheduler presents its certificate
//! and demands a CA-signed one from every worker; workers check the scheduler
//! against a fixed name because they usually dial it by address.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("TLS enabled but no {0} configured")]
    Unset(&'static str),

    #[error("{role} file does not exist: {}", .path.display())]
    Missing { role: &'static str, path: PathBuf },

    #[error("Failed to read TLS material: {0}")]
    IoError(#[from] std::io::Error),
}

/// Default name checked against the scheduler's certificate.
pub const DEFAULT_SERVER_NAME: &str = "oj-sandbox-scheduler";

/// CA plus this process's own certificate and key.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

async fn read_pem(role: &'static str, path: Option<&PathBuf>) -> Result<Vec<u8>, TlsError> {
    let path: &Path = path.ok_or(TlsError::Unset(role))?;
    if !path.exists() {
        return Err(TlsError::Missing {
            role,
            path: path.to_path_buf(),
        });
    }
    Ok(fs::read(path).await?)
}

impl TlsIdentity {
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca = read_pem("CA certificate", config.ca_cert_path.as_ref()).await?;
        let cert = read_pem("certificate", config.cert_path.as_ref()).await?;
        let key = read_pem("private key", config.key_path.as_ref()).await?;

        Ok(Self {
            identity: Identity::from_pem(cert, key),
            ca_cert: Certificate::from_pem(ca),
        })
    }

    /// Scheduler side: workers must present a certificate signed by the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Worker side. The scheduler's certificate is matched against
    /// `server_name`, not the dialled host.
    pub fn client_tls_config(&self, server_name: Option<&str>) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(server_name.unwrap_or(DEFAULT_SERVER_NAME))
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

/// Resolve the TLS settings into loaded material.
///
/// Returns `None` for plaintext. Incomplete or unreadable material is an
/// error unless `allow_insecure` is set, in which case it degrades to
/// plaintext with a warning.
pub async fn load_optional(config: &TlsConfig) -> Result<Option<TlsIdentity>, TlsError> {
    if !config.enabled {
        return Ok(None);
    }
    match TlsIdentity::load(config).await {
        Ok(identity) => {
            tracing::info!("Scheduler stream secured with mTLS");
            Ok(Some(identity))
        }
        Err(e) if config.allow_insecure => {
            tracing::warn!(error = %e, "TLS material unusable, falling back to plaintext");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_tls(allow_insecure: bool) -> TlsConfig {
        TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/oj-ca.pem")),
            cert_path: Some(PathBuf::from("/nonexistent/worker.pem")),
            key_path: Some(PathBuf::from("/nonexistent/worker.key")),
            allow_insecure,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enabled_without_ca_is_rejected() {
        let config = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        let err = load_optional(&config).await.err();
        assert!(matches!(err, Some(TlsError::Unset("CA certificate"))));
    }

    #[tokio::test]
    async fn unreadable_ca_names_the_file() {
        let err = TlsIdentity::load(&worker_tls(false)).await.err();
        match err {
            Some(TlsError::Missing { role, path }) => {
                assert_eq!(role, "CA certificate");
                assert!(path.ends_with("oj-ca.pem"));
            }
            _ => panic!("expected a missing CA file"),
        }
    }

    #[tokio::test]
    async fn insecure_worker_falls_back_to_plaintext() {
        assert!(load_optional(&worker_tls(true)).await.unwrap().is_none());
        assert!(load_optional(&TlsConfig::default()).await.unwrap().is_none());
    }
}
