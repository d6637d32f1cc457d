//! Worker side: dials the hub, runs tasks as local processes, reports back.
//!
//! - `runtime`: connection loop, task supervisors, kill handling
//! - `process`: child process spawn, output capture, termination
//! - `link`: the current hub connection, shared by supervisors
//! - `delivery`: retrying result delivery
//! - `projects`: project directory discovery
//! - `artifacts`: output file uploads

pub mod artifacts;
pub mod delivery;
pub mod link;
pub mod process;
pub mod projects;
pub mod runtime;

pub use link::HubLink;
pub use process::{ProcessOutput, TaskProcess};
pub use projects::discover_projects;
pub use runtime::WorkerRuntime;
