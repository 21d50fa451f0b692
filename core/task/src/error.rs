use actix_web::HttpResponse;
use thiserror::Error;

use atelier_model::{Envelope, ErrorKind};
use atelier_provider::ProviderError;
use atelier_storage::StoreError;

use crate::dao::DaoError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DAO error: {0}")]
    Dao(DaoError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Worker queue is full")]
    QueueFull,
    #[error("Service is shutting down")]
    ShuttingDown,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Service error: {0}")]
    Service(String),
}

impl From<DaoError> for Error {
    fn from(e: DaoError) -> Self {
        match e {
            DaoError::NotFound(what) => Error::NotFound(what),
            other => Error::Dao(other),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Service(e.to_string())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Dao(_) => ErrorKind::Internal,
            Error::Provider(e) => e.kind(),
            Error::Store(_) => ErrorKind::IoError,
            Error::QueueFull => ErrorKind::QueueFull,
            Error::ShuttingDown => ErrorKind::Canceled,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::BadRequest(_) => ErrorKind::InvalidParams,
            Error::Service(_) => ErrorKind::Internal,
        }
    }
}

impl actix_web::error::ResponseError for Error {
    fn error_response(&self) -> HttpResponse {
        let envelope: Envelope<()> = Envelope::failure(self.kind(), self.to_string());
        match self.kind() {
            ErrorKind::InvalidParams => HttpResponse::BadRequest().json(envelope),
            ErrorKind::QueueFull => HttpResponse::TooManyRequests().json(envelope),
            ErrorKind::NotFound => HttpResponse::NotFound().json(envelope),
            ErrorKind::UpstreamTransient => HttpResponse::BadGateway().json(envelope),
            ErrorKind::UpstreamRefused => HttpResponse::UnprocessableEntity().json(envelope),
            ErrorKind::Canceled | ErrorKind::Restart => HttpResponse::Conflict().json(envelope),
            ErrorKind::IoError | ErrorKind::Internal => {
                HttpResponse::InternalServerError().json(envelope)
            }
        }
    }
}
