//! # warden-core
//!
//! Supervisor/worker lifecycle engine that turns a repeatable unit of work
//! into a background service backed by a pool of forked worker processes.
//!
//! ## Components
//!
//! - [`registry`]: pid file recording the supervisor processes of a task
//! - [`signal`]: shutdown flag, handler installation, forwarding to workers
//! - [`pool`]: the supervisor's fill/reap loop and drain phase
//! - [`worker`]: each worker's execute loop with failure backoff
//! - [`lifecycle`]: `start`/`stop`/`restart`/`status`/`help`
//!
//! ## Example
//!
//! ```no_run
//! use warden_core::{
//!     Controller, Flow, MonitoredTask, Operation, TaskName, TaskOptions, WardenConfig,
//! };
//!
//! struct Tick;
//!
//! impl MonitoredTask for Tick {
//!     type Error = std::io::Error;
//!
//!     fn work(&mut self, _options: &TaskOptions) -> Result<Flow, Self::Error> {
//!         println!("tick");
//!         Ok(Flow::Continue)
//!     }
//! }
//!
//! let mut controller = Controller::new(Tick, TaskName::new("demo:tick"), WardenConfig::default());
//! let outcome = controller
//!     .run(Operation::Status, TaskOptions::new(), &mut std::io::stdout())
//!     .unwrap();
//! std::process::exit(outcome.exit_code());
//! ```

#[cfg(not(unix))]
compile_error!("warden-core needs fork(2), waitpid(2) and POSIX signals; build it for a unix target");

pub mod config;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod signal;
pub mod task;
pub mod worker;

pub use config::{ConfigError, Timings, WardenConfig};
pub use lifecycle::{CommandOutcome, Controller, LifecycleError, Operation};
pub use pool::{Supervisor, WorkerPool};
pub use registry::Registry;
pub use signal::{Role, ShutdownFlag, SignalDispatcher};
pub use task::{Flow, MonitoredTask, PoolSettings, TaskName, TaskOptions};
pub use worker::{ExecuteLoop, LoopExit};
