// Executor module for job run processes
// Launches child processes for due plan items and tracks them to completion

pub mod engine;
pub mod launcher;
pub mod workdir;

pub use engine::{ExecutionEngine, ExecutorConfig};
pub use launcher::{ChildProcess, ForkedProcessLauncher, LaunchRequest, ProcessLauncher};
pub use workdir::RunMetadata;
