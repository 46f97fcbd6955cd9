pub mod challenge;
mod cli;
pub mod core;
pub mod deploy;
pub mod domain;
pub mod issuance;
pub mod notify;
pub mod orchestrator;
pub mod platform;
pub mod renewal;
pub mod scheduler;
pub mod secrets;
pub mod storage;

pub use cli::run;
