use std::time::Duration;

use actix_web::HttpResponse;
use thiserror::Error;

use atelier_model::{Envelope, ErrorKind};

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Upstream transient failure: {0}")]
    Transient(String),
    #[error("Upstream refused the request: {0}")]
    Refused(String),
    #[error("Upstream returned an unusable payload: {0}")]
    Malformed(String),
    #[error("Upstream call exceeded {0:?}")]
    Timeout(Duration),
    #[error("Canceled")]
    Canceled,
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Unknown provider is a validation failure on the wire.
            ProviderError::InvalidParams(_) | ProviderError::UnknownProvider(_) => {
                ErrorKind::InvalidParams
            }
            ProviderError::Transient(_) | ProviderError::Timeout(_) => {
                ErrorKind::UpstreamTransient
            }
            ProviderError::Refused(_) | ProviderError::Malformed(_) => {
                ErrorKind::UpstreamRefused
            }
            ProviderError::Canceled => ErrorKind::Canceled,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return ProviderError::Transient(e.to_string());
        }
        if e.is_decode() {
            return ProviderError::Malformed(e.to_string());
        }
        ProviderError::Transient(e.to_string())
    }
}

impl actix_web::error::ResponseError for ProviderError {
    fn error_response(&self) -> HttpResponse {
        let envelope: Envelope<()> = Envelope::failure(self.kind(), self.to_string());
        match self.kind() {
            ErrorKind::InvalidParams => HttpResponse::BadRequest().json(envelope),
            ErrorKind::UpstreamTransient => HttpResponse::BadGateway().json(envelope),
            ErrorKind::UpstreamRefused => HttpResponse::UnprocessableEntity().json(envelope),
            ErrorKind::Canceled => HttpResponse::Conflict().json(envelope),
            _ => HttpResponse::InternalServerError().json(envelope),
        }
    }
}
