pub mod backoff;
mod conflict;
pub mod engine;
pub mod event;
pub mod ignore;
pub mod index;
pub mod local_watcher;
#[cfg(test)]
mod memory_remote;
pub mod orchestrator;
pub mod paths;
pub mod queue;
pub mod remote_watcher;
pub mod status;
pub mod throttle;
pub mod transfer;
