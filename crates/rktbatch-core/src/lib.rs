//! `rktbatch` Core Library
//!
//! Building blocks of the batch job supervisor:
//! - Scoped pipe and stream handles
//! - Cancellation token with a multiplexed wait
//! - SIGCHLD wakeup registration
//! - Child process spawn, group termination and reaping
//! - The stdin/stdout/stderr relay loop
//! - Operator console listener
//! - DD dataset resolution, environment block and configuration

pub mod cancel;
pub mod child;
pub mod config;
pub mod console;
pub mod dd;
pub mod env;
pub mod error;
pub mod handle;
pub mod relay;
pub mod signals;
pub mod tracing_init;

pub use cancel::{CancelToken, WaitOutcome, Watch};
pub use child::{ChildProcess, Launch, ProcessGroup, StdioMap, Termination};
pub use config::Config;
pub use dd::{DdTable, JobDatasets, OutputSinks};
pub use error::{Error, Result};
pub use handle::{Mode, Pipe, Stream};
pub use relay::{Channel, Relay, RelayPipes, RelayStats, Sinks};
