pub mod sandbox_service;
pub mod scheduler_service;
pub mod server;

pub use sandbox_service::SandboxFacade;
pub use scheduler_service::SchedulerGrpc;
pub use server::{serve_sandbox_admin, SchedulerServer};
