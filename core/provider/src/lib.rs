#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

pub mod adapter;
pub mod api;
pub mod dao;
mod db;
pub mod dimensions;
pub mod error;
mod gemini;
mod openai;
pub mod probe;
pub mod registry;

pub use adapter::{Adapter, CallCtx, GenerateOutput, GeneratedImage};
pub use error::ProviderError;
pub use registry::ProviderRegistry;

use atelier_persistence::executor::DbExecutor;

embed_migrations!("migrations");

/// Applies this crate's schema to the shared store.
pub fn run_migrations(db: &DbExecutor) -> std::result::Result<(), atelier_persistence::Error> {
    db.apply_migration(embedded_migrations::run_with_output)
}

pub type Result<T> = std::result::Result<T, error::ProviderError>;
