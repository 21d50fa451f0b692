use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use structopt::StructOpt;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use atelier_model::{
    GenerateParams, ProgressEvent, RefImage, Task, TaskPage,
};
use atelier_persistence::executor::DbExecutor;
use atelier_provider::adapter::CallCtx;
use atelier_provider::{GenerateOutput, ProviderError, ProviderRegistry};
use atelier_storage::{LocalStore, StoreError};

use crate::bus::ProgressBus;
use crate::dao::{ImageDao, LandedImage, NewTask, TaskDao};
use crate::db::models::{ImageStatus as DbImageStatus, TaskStatus as DbTaskStatus};
use crate::error::Error;
use crate::worker::QueueItem;
use crate::Result;

/// Reason recorded on restart-reconciled tasks.
pub const RESTART_REASON: &str = "restart";
/// Reason recorded on client-canceled tasks.
pub const CANCELED_REASON: &str = "canceled";

#[derive(StructOpt, Clone, Debug)]
pub struct TaskManagerConfig {
    /// Seconds a finished task's progress topic stays open for late subscribers.
    #[structopt(
        long = "progress-grace-secs",
        env = "ATELIER_PROGRESS_GRACE",
        default_value = "30"
    )]
    pub progress_grace_secs: u64,
    /// Directory reference-image path parameters must live under.
    #[structopt(long = "ref-root", env = "ATELIER_REF_ROOT")]
    pub ref_root: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Delete,
    Shutdown,
}

struct CancelSlot {
    flag: watch::Sender<bool>,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelSlot {
    fn new() -> CancelSlot {
        let (flag, _) = watch::channel(false);
        CancelSlot {
            flag,
            reason: Mutex::new(None),
        }
    }

    fn cancel(&self, reason: CancelReason) {
        *self.reason.lock().unwrap() = Some(reason);
        let _ = self.flag.send(true);
    }

    fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().unwrap()
    }
}

/// What a stream subscriber gets: a live event feed, or a single
/// synthetic event derived from the persisted row.
pub enum Subscription {
    Live(broadcast::Receiver<ProgressEvent>),
    Final(ProgressEvent),
}

/// Single writer for task rows and the only emitter of progress events.
pub struct TaskManager {
    db: DbExecutor,
    store: LocalStore,
    registry: Arc<ProviderRegistry>,
    bus: Arc<ProgressBus>,
    queue: Mutex<Option<mpsc::Sender<QueueItem>>>,
    cancels: Mutex<HashMap<String, Arc<CancelSlot>>>,
    accepting: AtomicBool,
    ref_root: Option<PathBuf>,
}

impl TaskManager {
    /// Builds the manager plus the queue consumed by the worker pool.
    pub fn new(
        db: DbExecutor,
        store: LocalStore,
        registry: Arc<ProviderRegistry>,
        config: &TaskManagerConfig,
        queue_capacity: usize,
    ) -> (Arc<TaskManager>, mpsc::Receiver<QueueItem>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let manager = Arc::new(TaskManager {
            db,
            store,
            registry,
            bus: Arc::new(ProgressBus::new(Duration::from_secs(
                config.progress_grace_secs,
            ))),
            queue: Mutex::new(Some(tx)),
            cancels: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            ref_root: config.ref_root.clone(),
        });
        (manager, rx)
    }

    pub fn bus(&self) -> Arc<ProgressBus> {
        self.bus.clone()
    }

    // ======================================== //
    // Submission
    // ======================================== //

    /// Validates, persists `queued` plus placeholders and enqueues. The
    /// queue slot is reserved first so saturation rejects the submission
    /// without touching the metadata store.
    pub async fn create(&self, provider: &str, params: GenerateParams) -> Result<Task> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let adapter = self.registry.get(provider)?;
        let params = params.clamp_count();
        adapter.validate(&params)?;

        let sender = self
            .queue
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::ShuttingDown)?;
        let permit = match sender.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => return Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(())) => return Err(Error::ShuttingDown),
        };

        let task_id = generate_id();
        let image_ids: Vec<String> = (0..params.count).map(|_| generate_id()).collect();
        let new_task = NewTask {
            natural_id: task_id.clone(),
            prompt: params.prompt.clone(),
            provider_name: provider.to_string(),
            model_id: params.model_id.clone(),
            aspect_ratio: params.aspect_ratio.to_string(),
            image_size: params.image_size.to_string(),
            timeout_secs: adapter.call_timeout().as_secs() as u32,
            config_json: config_snapshot(provider, &params),
            image_ids,
        };
        self.db.as_dao::<TaskDao>().create(new_task).await?;

        self.cancels
            .lock()
            .unwrap()
            .insert(task_id.clone(), Arc::new(CancelSlot::new()));
        self.bus.open(&task_id);

        permit.send(QueueItem {
            task_id: task_id.clone(),
            provider: provider.to_string(),
            params,
        });
        log::info!("Task [{}] accepted for provider [{}].", task_id, provider);
        self.get(&task_id).await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        let (task, images) = self.db.as_dao::<TaskDao>().get(task_id).await?;
        Ok(task.into_dto(images))
    }

    pub async fn list(
        &self,
        page: i64,
        page_size: i64,
        keyword: Option<String>,
    ) -> Result<TaskPage> {
        let (rows, total) = self
            .db
            .as_dao::<TaskDao>()
            .list(page, page_size, keyword)
            .await?;
        Ok(TaskPage {
            items: rows
                .into_iter()
                .map(|(task, images)| task.into_dto(images))
                .collect(),
            total,
            page,
            page_size,
        })
    }

    // ======================================== //
    // Worker side
    // ======================================== //

    /// Drives one queued task to a terminal state. Never propagates an
    /// error to the worker loop; the smallest failing unit is one image.
    pub async fn process(&self, item: QueueItem) {
        let task_id = item.task_id.clone();
        if let Err(error) = self.process_inner(item).await {
            log::error!("Task [{}] processing failed: {}", task_id, error);
            let _ = self
                .finalize(&task_id, DbTaskStatus::Failed, Some(error.to_string()))
                .await;
        }
    }

    async fn process_inner(&self, item: QueueItem) -> Result<()> {
        let QueueItem {
            task_id,
            provider,
            params,
        } = item;

        if !self.db.as_dao::<TaskDao>().start(&task_id).await? {
            log::debug!("Task [{}] is no longer queued, skipping.", task_id);
            self.drop_slot(&task_id);
            self.bus.close_now(&task_id);
            return Ok(());
        }

        let total = params.count;
        self.bus.publish(&ProgressEvent::Start {
            task_id: task_id.clone(),
            total,
        });

        let slot = self.slot(&task_id);
        let adapter = match self.registry.get(&provider) {
            Ok(adapter) => adapter,
            Err(error) => {
                return self
                    .finalize(&task_id, DbTaskStatus::Failed, Some(error.to_string()))
                    .await;
            }
        };
        let slot = match slot {
            Some(slot) => slot,
            // Deleted between enqueue and pickup.
            None => {
                return self
                    .finalize(
                        &task_id,
                        DbTaskStatus::Failed,
                        Some(CANCELED_REASON.to_string()),
                    )
                    .await;
            }
        };
        let ctx = CallCtx::new(slot.flag.subscribe(), adapter.call_timeout());

        let mut success: u32 = 0;
        let mut first_error: Option<String> = None;
        let mut cancel_reason: Option<CancelReason> = None;

        for idx in 0..total {
            if *ctx.cancel.borrow() {
                cancel_reason = slot.reason().or(Some(CancelReason::Delete));
                break;
            }

            match adapter.generate(&ctx, &params.single()).await {
                Ok(output) => match self.land(&task_id, idx, output).await {
                    Ok((image, completed)) => {
                        success += 1;
                        self.bus.publish(&ProgressEvent::Progress {
                            task_id: task_id.clone(),
                            completed,
                            total,
                            image: Some(image),
                        });
                    }
                    Err(Error::NotFound(_)) => {
                        cancel_reason = Some(CancelReason::Delete);
                        break;
                    }
                    Err(error) => {
                        log::warn!(
                            "Task [{}] image {} failed to persist: {}",
                            task_id,
                            idx,
                            error
                        );
                        first_error.get_or_insert(error.to_string());
                        match self.mark_failed(&task_id, idx).await {
                            Ok(completed) => self.publish_progress(&task_id, completed, total),
                            Err(Error::NotFound(_)) => {
                                cancel_reason = Some(CancelReason::Delete);
                                break;
                            }
                            Err(error) => return Err(error),
                        }
                    }
                },
                Err(ProviderError::Canceled) => {
                    cancel_reason = slot.reason().or(Some(CancelReason::Delete));
                    break;
                }
                Err(error) => {
                    log::warn!(
                        "Task [{}] image {} failed upstream: {}",
                        task_id,
                        idx,
                        error
                    );
                    first_error.get_or_insert(error.to_string());
                    match self.mark_failed(&task_id, idx).await {
                        Ok(completed) => self.publish_progress(&task_id, completed, total),
                        Err(Error::NotFound(_)) => {
                            cancel_reason = Some(CancelReason::Delete);
                            break;
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        let (status, message) = match cancel_reason {
            Some(CancelReason::Delete) => {
                (DbTaskStatus::Failed, Some(CANCELED_REASON.to_string()))
            }
            Some(CancelReason::Shutdown) => {
                (DbTaskStatus::Failed, Some(RESTART_REASON.to_string()))
            }
            None if success == total => (DbTaskStatus::Completed, None),
            None if success > 0 => (
                DbTaskStatus::Partial,
                Some(
                    first_error
                        .clone()
                        .unwrap_or_else(|| "some images failed".to_string()),
                ),
            ),
            None => (
                DbTaskStatus::Failed,
                Some(
                    first_error
                        .clone()
                        .unwrap_or_else(|| "generation failed".to_string()),
                ),
            ),
        };
        self.finalize(&task_id, status, message).await
    }

    fn publish_progress(&self, task_id: &str, completed: u32, total: u32) {
        self.bus.publish(&ProgressEvent::Progress {
            task_id: task_id.to_string(),
            completed,
            total,
            image: None,
        });
    }

    /// Persists one landed image: bytes and thumbnail into storage, row
    /// upgrade and counter bump in one transaction.
    async fn land(
        &self,
        task_id: &str,
        idx: u32,
        output: GenerateOutput,
    ) -> Result<(atelier_model::Image, u32)> {
        let generated = output
            .images
            .into_iter()
            .next()
            .ok_or_else(|| Error::Service("adapter returned no image".to_string()))?;

        let stem = format!("{}_{}", task_id, idx);
        let store = self.store.clone();
        let landed = tokio::task::spawn_blocking(
            move || -> std::result::Result<LandedImage, StoreError> {
                let path = store.put(&generated.bytes, &stem, &generated.ext)?;
                let thumb_path = match store.put_thumbnail(&generated.bytes, &stem) {
                    Ok(thumb) => thumb,
                    Err(error) => {
                        log::warn!("Thumbnail for [{}] failed: {}", stem, error);
                        None
                    }
                };
                Ok(LandedImage {
                    path: Some(path),
                    thumb_path,
                    byte_size: generated.bytes.len() as i64,
                    width: generated.width as i32,
                    height: generated.height as i32,
                    mime_type: Some(generated.mime),
                })
            },
        )
        .await??;

        let (image, completed) = self
            .db
            .as_dao::<ImageDao>()
            .record(task_id, idx, DbImageStatus::Success, landed)
            .await?;
        Ok((image.into_dto(task_id), completed.max(0) as u32))
    }

    async fn mark_failed(&self, task_id: &str, idx: u32) -> Result<u32> {
        let (_, completed) = self
            .db
            .as_dao::<ImageDao>()
            .record(task_id, idx, DbImageStatus::Failed, LandedImage::default())
            .await?;
        Ok(completed.max(0) as u32)
    }

    async fn finalize(
        &self,
        task_id: &str,
        status: DbTaskStatus,
        message: Option<String>,
    ) -> Result<()> {
        let outcome = self
            .db
            .as_dao::<TaskDao>()
            .finalize(task_id, status, message.clone())
            .await?;
        self.drop_slot(task_id);

        let outcome = match outcome {
            Some(outcome) => outcome,
            // Already terminal; the terminal event was emitted once.
            None => return Ok(()),
        };

        let event = match status {
            DbTaskStatus::Failed => ProgressEvent::Error {
                task_id: task_id.to_string(),
                message: message.unwrap_or_else(|| "generation failed".to_string()),
            },
            _ => ProgressEvent::Complete {
                task_id: task_id.to_string(),
                images_count: outcome.success_count.max(0) as u32,
            },
        };
        self.bus.publish(&event);
        self.bus.close_later(task_id.to_string());
        log::info!(
            "Task [{}] finalized as {:?} ({} of {} images).",
            task_id,
            status,
            outcome.success_count,
            outcome.task.total_count
        );
        Ok(())
    }

    // ======================================== //
    // Deletion
    // ======================================== //

    /// Client delete: cooperatively cancels a non-terminal task at its
    /// next I/O boundary. Landed artifacts are always preserved; removing
    /// them is image-level deletion's job. Repeating the delete, before
    /// or after the terminal state, is a no-op.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        if let Some(slot) = self.slot(task_id) {
            slot.cancel(CancelReason::Delete);
            log::info!("Task [{}] cancellation requested.", task_id);
            return Ok(());
        }
        // Terminal or unknown: nothing to cancel, nothing is destroyed.
        log::debug!("Delete for task [{}] had nothing to cancel.", task_id);
        Ok(())
    }

    /// Deletes one image and cascades the owning task once empty.
    pub async fn delete_image(&self, image_id: &str) -> Result<()> {
        let deletion = match self.db.as_dao::<ImageDao>().delete(image_id).await? {
            Some(deletion) => deletion,
            None => return Ok(()),
        };
        self.remove_files(deletion.paths).await;
        if deletion.task_empty {
            let paths = self
                .db
                .as_dao::<TaskDao>()
                .delete_cascade(&deletion.task_natural_id)
                .await?;
            self.remove_files(paths).await;
            self.bus.close_now(&deletion.task_natural_id);
        }
        Ok(())
    }

    async fn remove_files(&self, paths: Vec<String>) {
        if paths.is_empty() {
            return;
        }
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            for path in paths {
                if let Err(error) = store.remove(&path) {
                    log::warn!("Can't remove [{}]: {}", path, error);
                }
            }
        })
        .await;
        if let Err(error) = result {
            log::warn!("Storage cleanup task failed: {}", error);
        }
    }

    // ======================================== //
    // Reads for the transport layer
    // ======================================== //

    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription> {
        if let Some(receiver) = self.bus.subscribe(task_id) {
            return Ok(Subscription::Live(receiver));
        }
        Ok(Subscription::Final(self.final_event(task_id).await?))
    }

    /// Synthetic status event derived from the persisted row, used once
    /// the topic is gone.
    pub async fn final_event(&self, task_id: &str) -> Result<ProgressEvent> {
        let (task, images) = self.db.as_dao::<TaskDao>().get(task_id).await?;
        Ok(match task.status_id {
            DbTaskStatus::Failed => ProgressEvent::Error {
                task_id: task_id.to_string(),
                message: task
                    .error_message
                    .unwrap_or_else(|| "generation failed".to_string()),
            },
            DbTaskStatus::Completed | DbTaskStatus::Partial => ProgressEvent::Complete {
                task_id: task_id.to_string(),
                images_count: images
                    .iter()
                    .filter(|image| image.status_id == DbImageStatus::Success)
                    .count() as u32,
            },
            _ => ProgressEvent::Start {
                task_id: task_id.to_string(),
                total: task.total_count.max(0) as u32,
            },
        })
    }

    pub async fn image_bytes(&self, image_id: &str) -> Result<(Vec<u8>, String, String)> {
        let (image, _task) = self.db.as_dao::<ImageDao>().find(image_id).await?;
        let path = image
            .path
            .ok_or_else(|| Error::NotFound(format!("image bytes: {}", image_id)))?;
        let mime = image
            .mime_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let filename = path
            .rsplit('/')
            .next()
            .unwrap_or(path.as_str())
            .to_string();

        let store = self.store.clone();
        let bytes = tokio::task::spawn_blocking(move || store.read(&path)).await??;
        Ok((bytes, mime, filename))
    }

    /// Builds a ZIP of the requested images. The flag reports whether
    /// any entry was missing.
    pub async fn export(&self, image_ids: Vec<String>) -> Result<(Vec<u8>, bool)> {
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut partial = false;
        for image_id in image_ids {
            match self.db.as_dao::<ImageDao>().find(&image_id).await {
                Ok((image, _)) => match image.path {
                    Some(path) => entries.push((image.natural_id, path)),
                    None => partial = true,
                },
                Err(crate::dao::DaoError::NotFound(_)) => partial = true,
                Err(error) => return Err(error.into()),
            }
        }

        let store = self.store.clone();
        let (bytes, missing_files) =
            tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, bool)> {
                use std::io::Write;
                use zip::write::FileOptions;

                let mut missing = false;
                let cursor = std::io::Cursor::new(Vec::new());
                let mut writer = zip::ZipWriter::new(cursor);
                let options =
                    FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

                for (image_id, path) in entries {
                    let bytes = match store.read(&path) {
                        Ok(bytes) => bytes,
                        Err(error) => {
                            log::warn!("Export skips [{}]: {}", path, error);
                            missing = true;
                            continue;
                        }
                    };
                    let ext = path.rsplit('.').next().unwrap_or("bin");
                    writer
                        .start_file(format!("{}.{}", image_id, ext), options)
                        .map_err(|e| Error::Service(e.to_string()))?;
                    writer
                        .write_all(&bytes)
                        .map_err(|e| Error::Service(e.to_string()))?;
                }
                let cursor = writer
                    .finish()
                    .map_err(|e| Error::Service(e.to_string()))?;
                Ok((cursor.into_inner(), missing))
            })
            .await??;
        Ok((bytes, partial || missing_files))
    }

    /// Resolves a client-supplied reference path, constrained to the
    /// configured root so arbitrary files can't be read.
    pub async fn resolve_ref_path(&self, raw: &str) -> Result<RefImage> {
        use path_clean::PathClean;

        let root = self
            .ref_root
            .as_ref()
            .ok_or_else(|| Error::BadRequest("path references are disabled".to_string()))?;
        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            return Err(Error::BadRequest(format!(
                "reference path is not absolute: {}",
                raw
            )));
        }
        let clean = path.clean();
        if !clean.starts_with(root) {
            return Err(Error::BadRequest(format!(
                "reference path outside the allowed directory: {}",
                raw
            )));
        }

        let bytes = tokio::task::spawn_blocking(move || std::fs::read(clean))
            .await?
            .map_err(|e| Error::BadRequest(format!("can't read reference image: {}", e)))?;
        let info = atelier_provider::probe::probe(&bytes)
            .map_err(|e| Error::BadRequest(format!("reference is not an image: {}", e)))?;
        Ok(RefImage {
            bytes,
            mime: info.mime.to_string(),
            origin: raw.to_string(),
        })
    }

    // ======================================== //
    // Lifecycle
    // ======================================== //

    /// Startup pass: every task left non-terminal by a previous process
    /// is finalized before the listener binds.
    pub async fn reconcile(&self) -> Result<usize> {
        let finalized = self
            .db
            .as_dao::<TaskDao>()
            .reconcile_interrupted(RESTART_REASON)
            .await?;
        for task_id in &finalized {
            log::warn!(
                "Task [{}] was non-terminal at startup, finalized as failed({}).",
                task_id,
                RESTART_REASON
            );
        }
        Ok(finalized.len())
    }

    /// Stops taking submissions and cancels in-flight workers. Closing
    /// the queue lets idle workers drain out.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.queue.lock().unwrap().take();
        let cancels = self.cancels.lock().unwrap();
        for (task_id, slot) in cancels.iter() {
            log::debug!("Canceling in-flight task [{}] for shutdown.", task_id);
            slot.cancel(CancelReason::Shutdown);
        }
    }

    fn slot(&self, task_id: &str) -> Option<Arc<CancelSlot>> {
        self.cancels.lock().unwrap().get(task_id).cloned()
    }

    fn drop_slot(&self, task_id: &str) {
        self.cancels.lock().unwrap().remove(task_id);
    }
}

fn config_snapshot(provider: &str, params: &GenerateParams) -> String {
    serde_json::json!({
        "provider": provider,
        "modelId": params.model_id,
        "prompt": params.prompt,
        "aspectRatio": params.aspect_ratio,
        "imageSize": params.image_size,
        "count": params.count,
        "refImages": params
            .ref_images
            .iter()
            .map(|reference| serde_json::json!({
                "mime": reference.mime,
                "origin": reference.origin,
            }))
            .collect::<Vec<_>>(),
    })
    .to_string()
}

#[inline(always)]
pub(crate) fn generate_id() -> String {
    Uuid::new_v4().to_simple().to_string()
}
