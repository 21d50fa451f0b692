use actix_multipart::Multipart;
use actix_web::{web, Responder};
use futures::TryStreamExt;
use serde::Deserialize;
use std::str::FromStr;

use atelier_model::{
    AspectRatio, Envelope, GenerateParams, ImageSize, RefImage, MIN_COUNT,
};

use crate::error::Error;
use crate::manager::TaskManager;

pub fn extend_web_scope(scope: actix_web::Scope) -> actix_web::Scope {
    scope
        .service(generate)
        .service(generate_with_images)
        .service(delete_task)
}

#[derive(Clone, Debug, Deserialize)]
pub struct GenerateRequest {
    pub provider: String,
    #[serde(alias = "modelId")]
    pub model_id: String,
    pub params: GenerateBody,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub image_size: ImageSize,
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    MIN_COUNT
}

/// Text-to-image submission.
#[actix_web::post("/tasks/generate")]
async fn generate(
    manager: web::Data<TaskManager>,
    body: web::Json<GenerateRequest>,
) -> Result<impl Responder, Error> {
    let request = body.into_inner();
    let params = GenerateParams {
        prompt: request.params.prompt,
        model_id: request.model_id,
        aspect_ratio: request.params.aspect_ratio,
        image_size: request.params.image_size,
        count: request.params.count,
        ref_images: vec![],
    };
    let task = manager.create(&request.provider, params).await?;
    Ok(web::Json(Envelope::ok(task)))
}

/// Image-to-image submission: multipart form with inline reference
/// bytes (`refImages`) or validated local paths (`refPaths`).
#[actix_web::post("/tasks/generate-with-images")]
async fn generate_with_images(
    manager: web::Data<TaskManager>,
    mut payload: Multipart,
) -> Result<impl Responder, Error> {
    let mut prompt: Option<String> = None;
    let mut provider: Option<String> = None;
    let mut model_id: Option<String> = None;
    let mut aspect_ratio = AspectRatio::default();
    let mut image_size = ImageSize::default();
    let mut count = MIN_COUNT;
    let mut ref_images: Vec<RefImage> = Vec::new();

    while let Some(field) = payload
        .try_next()
        .await
        .map_err(|e| Error::BadRequest(e.to_string()))?
    {
        let name = field.name().to_string();
        let data = read_field(field).await?;
        match name.as_str() {
            "prompt" => prompt = Some(utf8_field("prompt", data)?),
            "provider" => provider = Some(utf8_field("provider", data)?),
            "model_id" | "modelId" => model_id = Some(utf8_field("model_id", data)?),
            "aspectRatio" => {
                let text = utf8_field("aspectRatio", data)?;
                aspect_ratio = AspectRatio::from_str(&text)
                    .map_err(|_| Error::BadRequest(format!("bad aspectRatio: {}", text)))?;
            }
            "imageSize" => {
                let text = utf8_field("imageSize", data)?;
                image_size = ImageSize::from_str(&text)
                    .map_err(|_| Error::BadRequest(format!("bad imageSize: {}", text)))?;
            }
            "count" => {
                let text = utf8_field("count", data)?;
                count = text
                    .trim()
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("bad count: {}", text)))?;
            }
            "refImages" | "refImages[]" => {
                let info = atelier_provider::probe::probe(&data)
                    .map_err(|e| Error::BadRequest(format!("bad reference image: {}", e)))?;
                ref_images.push(RefImage {
                    bytes: data,
                    mime: info.mime.to_string(),
                    origin: "inline".to_string(),
                });
            }
            "refPaths" | "refPaths[]" => {
                let raw = utf8_field("refPaths", data)?;
                ref_images.push(manager.resolve_ref_path(raw.trim()).await?);
            }
            other => log::debug!("Ignoring unknown multipart field [{}].", other),
        }
    }

    let params = GenerateParams {
        prompt: prompt.ok_or_else(|| Error::BadRequest("prompt part missing".into()))?,
        model_id: model_id.ok_or_else(|| Error::BadRequest("model_id part missing".into()))?,
        aspect_ratio,
        image_size,
        count,
        ref_images,
    };
    let provider =
        provider.ok_or_else(|| Error::BadRequest("provider part missing".into()))?;
    let task = manager.create(&provider, params).await?;
    Ok(web::Json(Envelope::ok(task)))
}

/// Cooperatively cancels a running task; landed images stay in place.
/// Idempotent, including after the task reached a terminal state.
#[actix_web::delete("/tasks/{task_id}")]
async fn delete_task(
    manager: web::Data<TaskManager>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    manager.delete_task(&path.into_inner()).await?;
    Ok(web::Json(Envelope::ok(serde_json::json!({ "deleted": true }))))
}

async fn read_field(mut field: actix_multipart::Field) -> Result<Vec<u8>, Error> {
    let mut buffer = Vec::new();
    while let Some(chunk) = field
        .try_next()
        .await
        .map_err(|e| Error::BadRequest(e.to_string()))?
    {
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn utf8_field(name: &str, data: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(data)
        .map_err(|_| Error::BadRequest(format!("field {} is not valid utf-8", name)))
}
