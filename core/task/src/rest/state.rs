use std::time::Duration;

use actix_web::{web, HttpResponse, Responder};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::broadcast;

use atelier_model::{Envelope, ProgressEvent};

use crate::error::Error;
use crate::manager::{Subscription, TaskManager};

const PING_INTERVAL: Duration = Duration::from_secs(15);

pub fn extend_web_scope(scope: actix_web::Scope) -> actix_web::Scope {
    scope
        .service(get_task)
        .service(stream_task)
        .service(list_tasks)
}

#[actix_web::get("/tasks/{task_id}")]
async fn get_task(
    manager: web::Data<TaskManager>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let task = manager.get(&path.into_inner()).await?;
    Ok(web::Json(Envelope::ok(task)))
}

#[derive(Deserialize, Debug)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(rename = "pageSize", default = "default_page_size")]
    pub page_size: i64,
    #[serde(default)]
    pub keyword: Option<String>,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

/// Paginated task gallery; the polling fallback for clients that can't
/// hold a stream open.
#[actix_web::get("/images")]
async fn list_tasks(
    manager: web::Data<TaskManager>,
    query: web::Query<ListQuery>,
) -> Result<impl Responder, Error> {
    let page = manager
        .list(query.page, query.page_size, query.keyword.clone())
        .await?;
    Ok(web::Json(Envelope::ok(page)))
}

/// Server-pushed progress stream. A subscriber joining after the grace
/// window gets one synthetic status event, then EOF.
#[actix_web::get("/tasks/{task_id}/stream")]
async fn stream_task(
    manager: web::Data<TaskManager>,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let task_id = path.into_inner();
    let subscription = manager.subscribe(&task_id).await?;
    let manager = manager.clone();

    let stream = async_stream::stream! {
        let mut seq: u64 = 0;
        match subscription {
            Subscription::Final(event) => {
                yield event_frame(&event, seq);
            }
            Subscription::Live(mut receiver) => {
                let mut ping = tokio::time::interval(PING_INTERVAL);
                ping.tick().await;
                loop {
                    tokio::select! {
                        _ = ping.tick() => {
                            yield Ok(Bytes::from_static(b":ping\n\n"));
                        }
                        received = receiver.recv() => match received {
                            Ok(event) => {
                                let terminal = event.is_terminal();
                                yield event_frame(&event, seq);
                                seq += 1;
                                if terminal {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                log::debug!(
                                    "Stream for [{}] lagged, skipped {} events.",
                                    task_id,
                                    skipped
                                );
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                // Topic closed between events; report the
                                // persisted outcome instead of going silent.
                                if let Ok(event) = manager.final_event(&task_id).await {
                                    yield event_frame(&event, seq);
                                }
                                break;
                            }
                        }
                    }
                }
            }
        }
    };

    Ok(HttpResponse::Ok()
        .content_type(mime::TEXT_EVENT_STREAM.essence_str())
        .streaming(stream))
}

fn event_frame(event: &ProgressEvent, id: u64) -> Result<Bytes, actix_web::Error> {
    let json = serde_json::to_string(event)
        .map_err(|e| actix_web::Error::from(Error::Service(e.to_string())))?;
    let mut bytes = BytesMut::with_capacity(128 + json.len());
    bytes.put_slice(b"event: ");
    bytes.put_slice(event.event_name().as_bytes());
    bytes.put_slice(b"\ndata: ");
    bytes.put_slice(json.as_bytes());
    bytes.put_slice(b"\nid: ");
    bytes.put_slice(id.to_string().as_bytes());
    bytes.put_slice(b"\n\n");
    Ok(bytes.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_follow_the_event_stream_format() {
        let event = ProgressEvent::Start {
            task_id: "t1".into(),
            total: 3,
        };
        let frame = event_frame(&event, 7).unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: start\ndata: {"));
        assert!(text.contains("\"taskId\":\"t1\""));
        assert!(text.ends_with("\nid: 7\n\n"));
    }
}
