use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Slot provisioning failed for slot {slot}: {reason}")]
    Provision { slot: u32, reason: String },

    #[error("No active sandbox instance available")]
    NoActiveInstance,

    #[error("Job queue full for instance {0}")]
    QueueFull(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Judge script unavailable: {0}")]
    Script(String),

    #[error("Source checkout failed: {0}")]
    Checkout(String),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] crate::tls::TlsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl From<SandboxError> for tonic::Status {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NoActiveInstance => tonic::Status::unavailable(err.to_string()),
            SandboxError::QueueFull(_) => tonic::Status::resource_exhausted(err.to_string()),
            SandboxError::InstanceNotFound(_) => tonic::Status::not_found(err.to_string()),
            SandboxError::Protocol(_) => tonic::Status::invalid_argument(err.to_string()),
            SandboxError::Script(_) => tonic::Status::not_found(err.to_string()),
            SandboxError::GrpcError(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_map_to_retryable_codes() {
        let status: tonic::Status = SandboxError::NoActiveInstance.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = SandboxError::QueueFull("a".into()).into();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert!(status.message().contains("a"));
    }

    #[test]
    fn io_errors_become_internal() {
        let err: SandboxError = std::io::Error::other("disk gone").into();
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
