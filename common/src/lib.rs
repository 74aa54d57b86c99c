// Common library for the job server and the job runner
// Scheduling, process execution and the back-channel between them

pub mod backchannel;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
