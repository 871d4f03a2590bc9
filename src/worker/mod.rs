//! Node-local half: slots, script execution, and the scheduler connection.
//!
//! # Components
//!
//! - [`SlotPool`]: fixed set of sandbox slots with FIFO hand-off on release
//! - [`isolation`]: backends binding a slot to an environment (`isolate`, host shell)
//! - [`Executor`]: runs one script in one slot under a wall-clock budget
//! - [`JobRunner`]: fetch source, pick the judge script, execute, grade, record
//! - [`WorkerRuntime`]: reconnecting stream to the scheduler
//!
//! # Job flow
//!
//! 1. The scheduler pushes a job request down the stream
//! 2. [`WorkerRuntime`] spawns a task so the receive loop never blocks
//! 3. [`JobRunner::run_job`] provisions the checkout and resolves the script
//! 4. [`Executor::run`] waits for a slot, runs the script, releases the slot
//! 5. The outcome goes to the result sink, then back up the stream

pub mod executor;
pub mod grading;
pub mod heartbeat;
pub mod isolation;
pub mod pool;
pub mod provision;
pub mod runner;
pub mod runtime;
pub mod scripts;

pub use executor::{ExecStatus, ExecutionResult, Executor};
pub use isolation::{HostShell, Isolate, Isolation};
pub use pool::{PoolStatus, SlotGuard, SlotPool};
pub use provision::{GitProvisioner, Provisioner, SourceRequest};
pub use runner::JobRunner;
pub use runtime::WorkerRuntime;
pub use scripts::{DirScriptCatalog, ScriptCatalog, StaticScripts};
