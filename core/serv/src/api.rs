use std::sync::Arc;

use actix_web::{web, Responder, Scope};

use atelier_model::Envelope;
use atelier_persistence::executor::DbExecutor;
use atelier_provider::ProviderRegistry;
use atelier_task::TaskManager;

use crate::templates::{self, TemplateService};

/// Mounts every domain scope plus the health probe under the API root.
pub fn web_scope(
    db: &DbExecutor,
    registry: &Arc<ProviderRegistry>,
    manager: &Arc<TaskManager>,
    templates_service: &Arc<TemplateService>,
) -> Scope {
    let scope = web::scope(atelier_model::API_ROOT)
        .app_data(web::Data::new(db.clone()))
        .app_data(web::Data::from(registry.clone()))
        .app_data(web::Data::from(manager.clone()))
        .app_data(web::Data::from(templates_service.clone()))
        .service(health);
    let scope = atelier_provider::api::extend_web_scope(scope);
    let scope = atelier_task::api::extend_web_scope(scope);
    templates::extend_web_scope(scope)
}

#[actix_web::get("/health")]
async fn health() -> impl Responder {
    web::Json(Envelope::ok(serde_json::json!({ "status": "ok" })))
}
