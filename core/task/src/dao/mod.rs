mod image;
mod task;

pub use image::{ImageDao, ImageDeletion, LandedImage};
pub use task::{FinalizeOutcome, NewTask, TaskDao};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaoError>;

no_arg_sql_function!(last_insert_rowid, diesel::sql_types::Integer);

#[derive(Error, Debug)]
pub enum DaoError {
    #[error("Diesel error: {0}")]
    DieselError(#[from] diesel::result::Error),
    #[error("Runtime error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("Pool error: {0}")]
    R2D2Error(#[from] r2d2::Error),
    #[error("Serde Json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}
