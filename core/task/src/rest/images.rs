use actix_web::http::header;
use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;

use atelier_model::Envelope;

use crate::error::Error;
use crate::manager::TaskManager;

pub fn extend_web_scope(scope: actix_web::Scope) -> actix_web::Scope {
    scope
        .service(delete_image)
        .service(download_image)
        .service(export_images)
}

/// Removes one image; the owning task cascades away once empty.
#[actix_web::delete("/images/{image_id}")]
async fn delete_image(
    manager: web::Data<TaskManager>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    manager.delete_image(&path.into_inner()).await?;
    Ok(web::Json(Envelope::ok(serde_json::json!({ "deleted": true }))))
}

/// Original bytes with their recorded MIME type.
#[actix_web::get("/images/{image_id}/download")]
async fn download_image(
    manager: web::Data<TaskManager>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let (bytes, mime, filename) = manager.image_bytes(&path.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .content_type(mime)
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ))
        .body(bytes))
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExportRequest {
    #[serde(rename = "imageIds")]
    pub image_ids: Vec<String>,
}

/// ZIP archive of the requested originals. `X-Export-Partial: true`
/// flags entries that were missing.
#[actix_web::post("/images/export")]
async fn export_images(
    manager: web::Data<TaskManager>,
    body: web::Json<ExportRequest>,
) -> Result<HttpResponse, Error> {
    let request = body.into_inner();
    if request.image_ids.is_empty() {
        return Err(Error::BadRequest("imageIds is empty".into()));
    }
    let (bytes, partial) = manager.export(request.image_ids).await?;

    let mut response = HttpResponse::Ok();
    response.content_type("application/zip");
    response.insert_header((
        header::CONTENT_DISPOSITION,
        "attachment; filename=\"export.zip\"",
    ));
    if partial {
        response.insert_header(("X-Export-Partial", "true"));
    }
    Ok(response.body(bytes))
}
