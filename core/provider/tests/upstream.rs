use std::net::TcpListener;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};
use serde_json::json;

use atelier_model::{AspectRatio, GenerateParams, ImageSize, ProviderConfig};
use atelier_provider::adapter::CallCtx;
use atelier_provider::registry::build_adapter;
use atelier_provider::ProviderError;

fn encoded_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([128, 64, 32]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

fn params() -> GenerateParams {
    GenerateParams {
        prompt: "a lighthouse at dusk".to_string(),
        model_id: "test-model".to_string(),
        aspect_ratio: AspectRatio::Square,
        image_size: ImageSize::OneK,
        count: 1,
        ref_images: vec![],
    }
}

fn config(name: &str, port: u16, max_retries: u32) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        display_name: name.to_string(),
        api_base: format!("http://127.0.0.1:{}", port),
        api_key: "test-key".to_string(),
        extra: None,
        enabled: true,
        timeout_secs: 10,
        max_retries,
    }
}

/// Starts a fake upstream on a free local port; the factory builds the
/// route table, the counter observes every request.
fn spawn_upstream<F>(factory: F) -> u16
where
    F: Fn() -> actix_web::Scope + Send + Clone + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = HttpServer::new(move || App::new().service(factory()))
        .listen(listener)
        .unwrap()
        .workers(1)
        .run();
    actix_rt::spawn(async move {
        let _ = server.await;
    });
    port
}

#[actix_rt::test]
async fn gemini_round_trips_inline_payloads() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let port = spawn_upstream(move || {
        let counter = counter.clone();
        web::scope("/v1beta/models").route(
            "/{call:.*}",
            web::post().to(move |_body: web::Json<serde_json::Value>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    HttpResponse::Ok().json(json!({
                        "candidates": [{
                            "content": {
                                "parts": [{
                                    "inlineData": {
                                        "mimeType": "image/png",
                                        "data": base64::encode(encoded_png(64, 64)),
                                    }
                                }]
                            }
                        }]
                    }))
                }
            }),
        )
    });

    let adapter = build_adapter(config("gemini", port, 0)).unwrap();
    let ctx = CallCtx::detached(Duration::from_secs(10));
    let output = adapter.generate(&ctx, &params()).await.unwrap();

    assert_eq!(output.images.len(), 1);
    assert_eq!(output.images[0].mime, "image/png");
    assert_eq!(output.images[0].width, 64);
    assert_eq!(output.images[0].height, 64);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[actix_rt::test]
async fn gemini_retries_rate_limits_then_succeeds() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let port = spawn_upstream(move || {
        let counter = counter.clone();
        web::scope("/v1beta/models").route(
            "/{call:.*}",
            web::post().to(move |_body: web::Bytes| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        HttpResponse::TooManyRequests()
                            .json(json!({ "error": { "message": "slow down" } }))
                    } else {
                        HttpResponse::Ok().json(json!({
                            "candidates": [{
                                "content": {
                                    "parts": [{
                                        "inlineData": {
                                            "mimeType": "image/png",
                                            "data": base64::encode(encoded_png(16, 16)),
                                        }
                                    }]
                                }
                            }]
                        }))
                    }
                }
            }),
        )
    });

    let adapter = build_adapter(config("gemini", port, 3)).unwrap();
    let ctx = CallCtx::detached(Duration::from_secs(10));
    let output = adapter.generate(&ctx, &params()).await.unwrap();

    assert_eq!(output.images.len(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[actix_rt::test]
async fn gemini_never_retries_refusals() {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let port = spawn_upstream(move || {
        let counter = counter.clone();
        web::scope("/v1beta/models").route(
            "/{call:.*}",
            web::post().to(move |_body: web::Bytes| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    HttpResponse::BadRequest()
                        .json(json!({ "error": { "message": "unsafe prompt" } }))
                }
            }),
        )
    });

    let adapter = build_adapter(config("gemini", port, 5)).unwrap();
    let ctx = CallCtx::detached(Duration::from_secs(10));
    let result = adapter.generate(&ctx, &params()).await;

    match result {
        Err(ProviderError::Refused(message)) => assert!(message.contains("unsafe prompt")),
        other => panic!("expected refusal, got {:?}", other.map(|o| o.images.len())),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[actix_rt::test]
async fn openai_generations_and_prompt_rewrite() {
    let port = spawn_upstream(|| {
        web::scope("/v1")
            .route(
                "/images/generations",
                web::post().to(|body: web::Json<serde_json::Value>| async move {
                    assert_eq!(body["response_format"], "b64_json");
                    assert_eq!(body["size"], "1024x1024");
                    HttpResponse::Ok().json(json!({
                        "data": [
                            { "b64_json": base64::encode(encoded_png(32, 32)) },
                        ]
                    }))
                }),
            )
            .route(
                "/chat/completions",
                web::post().to(|_body: web::Bytes| async move {
                    HttpResponse::Ok().json(json!({
                        "choices": [{
                            "message": { "role": "assistant", "content": "a better prompt" }
                        }]
                    }))
                }),
            )
    });

    let adapter = build_adapter(config("openai", port, 0)).unwrap();
    let ctx = CallCtx::detached(Duration::from_secs(10));

    let output = adapter.generate(&ctx, &params()).await.unwrap();
    assert_eq!(output.images.len(), 1);
    assert_eq!(output.images[0].width, 32);

    let rewritten = adapter
        .optimize_prompt(&ctx, "test-model", "a lighthouse", None)
        .await
        .unwrap();
    assert_eq!(rewritten, "a better prompt");
}

#[actix_rt::test]
async fn garbage_payload_fails_that_image() {
    let port = spawn_upstream(|| {
        web::scope("/v1beta/models").route(
            "/{call:.*}",
            web::post().to(|_body: web::Bytes| async move {
                HttpResponse::Ok().json(json!({
                    "candidates": [{
                        "content": {
                            "parts": [{
                                "inlineData": {
                                    "mimeType": "image/png",
                                    "data": base64::encode(b"not pixels at all"),
                                }
                            }]
                        }
                    }]
                }))
            }),
        )
    });

    let adapter = build_adapter(config("gemini", port, 0)).unwrap();
    let ctx = CallCtx::detached(Duration::from_secs(10));
    match adapter.generate(&ctx, &params()).await {
        Err(ProviderError::Malformed(_)) => (),
        other => panic!("expected malformed payload, got {:?}", other.map(|o| o.images.len())),
    }
}
