#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

pub mod api;
pub mod bus;
pub mod dao;
mod db;
pub mod error;
pub mod manager;
mod rest;
pub mod worker;

pub use bus::ProgressBus;
pub use error::Error;
pub use manager::{TaskManager, TaskManagerConfig};
pub use worker::{QueueItem, RunnerConfig, WorkerPool};

use atelier_persistence::executor::DbExecutor;

embed_migrations!("migrations");

/// Applies this crate's schema to the shared store.
pub fn run_migrations(db: &DbExecutor) -> std::result::Result<(), atelier_persistence::Error> {
    db.apply_migration(embedded_migrations::run_with_output)
}

pub type Result<T> = std::result::Result<T, error::Error>;
