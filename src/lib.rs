pub mod algorithm;
pub mod api;
pub mod artifact_store;
mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod metastore;
pub mod models;
pub mod planner;
pub mod pool;
mod queue;
mod recovery;
pub mod registry;
pub mod runner;
pub mod scoring;
#[cfg(test)]
mod testing;

pub use config::{Config, LifecycleConfig};
pub use error::{JobError, Result};
pub use lifecycle::{JobLifecycle, PurgeReport};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub lifecycle: JobLifecycle,
}
