use actix_web::error::ResponseError;
use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use atelier_model::{Envelope, ErrorKind, ProviderConfig};
use atelier_persistence::executor::DbExecutor;

use crate::adapter::CallCtx;
use crate::dao::{DaoError, ProviderConfigDao};
use crate::error::ProviderError;
use crate::registry::ProviderRegistry;

/// System prompt used by the prompt rewriting endpoint.
pub(crate) const OPTIMIZE_INSTRUCTION: &str = "Rewrite the user's image prompt so a \
text-to-image model produces a richer result. Keep the original subject and intent, \
add concrete visual detail (lighting, composition, material, mood) and answer with \
the rewritten prompt only.";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("DAO error: {0}")]
    Dao(#[from] DaoError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Service error: {0}")]
    Service(String),
}

impl ApiError {
    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Provider(e) => e.kind(),
            ApiError::Dao(DaoError::NotFound(_)) => ErrorKind::NotFound,
            ApiError::Dao(_) => ErrorKind::Internal,
            ApiError::BadRequest(_) => ErrorKind::InvalidParams,
            ApiError::Service(_) => ErrorKind::Internal,
        }
    }
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ApiError::Provider(e) => e.error_response(),
            other => {
                let envelope: Envelope<()> = Envelope::failure(other.kind(), other.to_string());
                match other.kind() {
                    ErrorKind::InvalidParams => HttpResponse::BadRequest().json(envelope),
                    ErrorKind::NotFound => HttpResponse::NotFound().json(envelope),
                    _ => HttpResponse::InternalServerError().json(envelope),
                }
            }
        }
    }
}

/// Registers provider endpoints on an API scope.
pub fn extend_web_scope(scope: actix_web::Scope) -> actix_web::Scope {
    scope
        .service(list_providers)
        .service(get_provider_config)
        .service(update_provider_config)
        .service(optimize_prompt)
}

#[actix_web::get("/providers")]
async fn list_providers(registry: web::Data<ProviderRegistry>) -> impl Responder {
    web::Json(Envelope::ok(registry.list()))
}

#[actix_web::get("/providers/config")]
async fn get_provider_config(
    db: web::Data<DbExecutor>,
) -> Result<impl Responder, ApiError> {
    let configs = db.as_dao::<ProviderConfigDao>().list().await?;
    Ok(web::Json(Envelope::ok(configs)))
}

#[actix_web::post("/providers/config")]
async fn update_provider_config(
    db: web::Data<DbExecutor>,
    registry: web::Data<ProviderRegistry>,
    body: web::Json<ProviderConfig>,
) -> Result<impl Responder, ApiError> {
    let config = body.into_inner();
    if config.name.trim().is_empty() {
        return Err(ApiError::BadRequest("provider name is empty".into()));
    }
    if config.api_base.trim().is_empty() {
        return Err(ApiError::BadRequest("api base is empty".into()));
    }

    db.as_dao::<ProviderConfigDao>().upsert(&config).await?;
    registry
        .reload(db.get_ref())
        .await
        .map_err(|e| ApiError::Service(format!("registry reload failed: {:#}", e)))?;

    let configs = db.as_dao::<ProviderConfigDao>().list().await?;
    Ok(web::Json(Envelope::ok(configs)))
}

#[derive(Clone, Debug, Deserialize)]
pub struct OptimizeRequest {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub response_format: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct OptimizeResponse {
    pub prompt: String,
}

#[actix_web::post("/prompts/optimize")]
async fn optimize_prompt(
    registry: web::Data<ProviderRegistry>,
    body: web::Json<OptimizeRequest>,
) -> Result<impl Responder, ApiError> {
    let request = body.into_inner();
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt is empty".into()));
    }

    let adapter = registry.get(&request.provider)?;
    let ctx = CallCtx::detached(adapter.call_timeout());
    let rewritten = adapter
        .optimize_prompt(
            &ctx,
            &request.model,
            &request.prompt,
            request.response_format.as_deref(),
        )
        .await?;
    Ok(web::Json(Envelope::ok(OptimizeResponse { prompt: rewritten })))
}
