pub mod config;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod scheduler;
pub mod shutdown;
pub mod sink;
pub mod tls;
pub mod wire;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("sandbox");
}

pub use dispatch::Dispatcher;
pub use error::{Result, SandboxError};
