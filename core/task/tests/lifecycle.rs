use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Semaphore};

use atelier_model::{
    AspectRatio, GenerateParams, ImageSize, ImageStatus, ProgressEvent, ProviderDescriptor,
    TaskStatus,
};
use atelier_persistence::executor::DbExecutor;
use atelier_provider::adapter::{canceled, validate_common, Adapter, CallCtx, GenerateOutput};
use atelier_provider::{GeneratedImage, ProviderError, ProviderRegistry};
use atelier_storage::LocalStore;
use atelier_task::manager::{Subscription, TaskManagerConfig};
use atelier_task::{Error, RunnerConfig, TaskManager, WorkerPool};

const PROVIDER: &str = "stub";

/// Scripted upstream behavior, consumed one entry per generate call.
#[derive(Clone)]
enum Step {
    Produce,
    Refuse(&'static str),
    Sleep(Duration),
    /// Waits for a permit before producing, so tests control pacing.
    Gate(Arc<Semaphore>),
}

struct StubAdapter {
    steps: Mutex<VecDeque<Step>>,
    png: Vec<u8>,
}

impl StubAdapter {
    fn new(steps: Vec<Step>) -> Arc<StubAdapter> {
        Arc::new(StubAdapter {
            steps: Mutex::new(steps.into()),
            png: encoded_png(1024, 1024),
        })
    }

    fn output(&self) -> Result<GenerateOutput, ProviderError> {
        Ok(GenerateOutput {
            images: vec![GeneratedImage {
                bytes: self.png.clone(),
                mime: "image/png".to_string(),
                ext: "png".to_string(),
                width: 1024,
                height: 1024,
            }],
            meta: serde_json::json!({ "provider": PROVIDER }),
        })
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            name: PROVIDER.to_string(),
            display_name: "Stub".to_string(),
            family: "stub".to_string(),
            enabled: true,
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn validate(&self, params: &GenerateParams) -> Result<(), ProviderError> {
        validate_common(params)
    }

    async fn generate(
        &self,
        ctx: &CallCtx,
        _params: &GenerateParams,
    ) -> Result<GenerateOutput, ProviderError> {
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Produce);
        match step {
            Step::Produce => self.output(),
            Step::Refuse(message) => Err(ProviderError::Refused(message.to_string())),
            Step::Sleep(delay) => {
                tokio::select! {
                    biased;
                    _ = canceled(ctx.cancel.clone()) => Err(ProviderError::Canceled),
                    _ = tokio::time::sleep(delay) => self.output(),
                }
            }
            Step::Gate(gate) => {
                let permit = tokio::select! {
                    biased;
                    _ = canceled(ctx.cancel.clone()) => return Err(ProviderError::Canceled),
                    permit = gate.acquire() => permit,
                };
                permit.unwrap().forget();
                self.output()
            }
        }
    }

    async fn optimize_prompt(
        &self,
        _ctx: &CallCtx,
        _model: &str,
        prompt: &str,
        _response_format: Option<&str>,
    ) -> Result<String, ProviderError> {
        Ok(format!("{} (optimized)", prompt))
    }
}

fn encoded_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 80, 120]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageOutputFormat::Png)
        .unwrap();
    out.into_inner()
}

struct TestEnv {
    _dir: tempdir::TempDir,
    store: LocalStore,
    manager: Arc<TaskManager>,
    runner: RunnerConfig,
    queue: Option<tokio::sync::mpsc::Receiver<atelier_task::QueueItem>>,
    pool: Option<WorkerPool>,
}

impl TestEnv {
    /// Starts draining the queue. Kept separate so tests can subscribe
    /// to a task's topic before any worker touches it.
    fn start(&mut self) {
        let queue = self.queue.take().expect("pool already started");
        self.pool = Some(WorkerPool::spawn(
            self.manager.clone(),
            queue,
            &self.runner,
        ));
    }

    async fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown(&self.manager).await;
        }
    }
}

fn spawn_env(adapter: Arc<StubAdapter>, runner: RunnerConfig, grace_secs: u64) -> TestEnv {
    let dir = tempdir::TempDir::new("atelier-task-test").unwrap();
    let db = DbExecutor::from_data_dir(dir.path(), "test").unwrap();
    atelier_provider::run_migrations(&db).unwrap();
    atelier_task::run_migrations(&db).unwrap();

    let store = LocalStore::new(&dir.path().join("storage"), false).unwrap();
    let registry = Arc::new(ProviderRegistry::new(None));
    registry.insert(adapter);

    let config = TaskManagerConfig {
        progress_grace_secs: grace_secs,
        ref_root: Some(dir.path().to_path_buf()),
    };
    let (manager, queue) = TaskManager::new(
        db,
        store.clone(),
        registry,
        &config,
        runner.queue_capacity,
    );
    TestEnv {
        _dir: dir,
        store,
        manager,
        runner,
        queue: Some(queue),
        pool: None,
    }
}

fn params(count: u32) -> GenerateParams {
    GenerateParams {
        prompt: "a cat".to_string(),
        model_id: "stub-model".to_string(),
        aspect_ratio: AspectRatio::Square,
        image_size: ImageSize::OneK,
        count,
        ref_images: vec![],
    }
}

async fn wait_terminal(manager: &TaskManager, task_id: &str) -> atelier_model::Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = manager.get(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task [{}] did not reach a terminal state",
            task_id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn collect_until_terminal(
    receiver: &mut broadcast::Receiver<ProgressEvent>,
) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), receiver.recv()).await {
            Ok(Ok(event)) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => panic!("no terminal event within the timeout"),
        }
    }
    events
}

#[actix_rt::test]
async fn text_to_image_happy_path() {
    let adapter = StubAdapter::new(vec![]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 30);

    let task = env.manager.create(PROVIDER, params(3)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.total_count, 3);
    assert_eq!(task.images.len(), 3);
    assert!(task
        .images
        .iter()
        .all(|image| image.status == ImageStatus::Pending));

    // Subscribe before any worker runs so the full event order is seen.
    let mut receiver = match env.manager.subscribe(&task.id).await.unwrap() {
        Subscription::Live(receiver) => receiver,
        Subscription::Final(_) => panic!("expected a live topic"),
    };
    env.start();

    let done = wait_terminal(&env.manager, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.completed_count, 3);
    assert_eq!(done.images.len(), 3);
    for image in &done.images {
        assert_eq!(image.status, ImageStatus::Success);
        assert_eq!(image.width, 1024);
        assert_eq!(image.height, 1024);
        assert_eq!(image.width % 8, 0);
        assert_eq!(image.height % 8, 0);
        let path = image.path.as_ref().expect("stored path");
        assert!(!env.store.read(path).unwrap().is_empty());
    }
    assert!(done.error_message.is_none());

    let events = collect_until_terminal(&mut receiver).await;
    assert!(matches!(events.first(), Some(ProgressEvent::Start { total: 3, .. })));
    let progress: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::Progress { completed, .. } => Some(*completed),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![1, 2, 3]);
    match events.last() {
        Some(ProgressEvent::Complete { images_count, .. }) => assert_eq!(*images_count, 3),
        other => panic!("expected complete last, got {:?}", other),
    }
    let terminal_count = events.iter().filter(|event| event.is_terminal()).count();
    assert_eq!(terminal_count, 1);

    env.shutdown().await;
}

#[actix_rt::test]
async fn partial_failure_keeps_going() {
    let adapter = StubAdapter::new(vec![Step::Produce, Step::Refuse("content blocked")]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 30);

    let task = env.manager.create(PROVIDER, params(2)).await.unwrap();
    let mut receiver = match env.manager.subscribe(&task.id).await.unwrap() {
        Subscription::Live(receiver) => receiver,
        Subscription::Final(event) => panic!("unexpected early final: {:?}", event),
    };
    env.start();

    let done = wait_terminal(&env.manager, &task.id).await;
    assert_eq!(done.status, TaskStatus::Partial);
    assert_eq!(done.completed_count, 2);
    assert!(done.error_message.as_deref().unwrap_or("").contains("blocked"));

    let success: Vec<_> = done
        .images
        .iter()
        .filter(|image| image.status == ImageStatus::Success)
        .collect();
    let failed: Vec<_> = done
        .images
        .iter()
        .filter(|image| image.status == ImageStatus::Failed)
        .collect();
    assert_eq!(success.len(), 1);
    assert_eq!(failed.len(), 1);
    assert_eq!(success[0].index, 0);
    assert_eq!(failed[0].index, 1);

    // Partial completions still end with `complete`.
    let events = collect_until_terminal(&mut receiver).await;
    match events.last() {
        Some(ProgressEvent::Complete { images_count, .. }) => assert_eq!(*images_count, 1),
        other => panic!("expected complete last, got {:?}", other),
    }

    env.shutdown().await;
}

#[actix_rt::test]
async fn saturated_queue_rejects_without_persisting() {
    let gate = Arc::new(Semaphore::new(0));
    let adapter = StubAdapter::new(vec![
        Step::Gate(gate.clone()),
        Step::Gate(gate.clone()),
        Step::Produce,
    ]);
    let runner = RunnerConfig {
        workers: 1,
        queue_capacity: 1,
        shutdown_grace_secs: 5,
    };
    let mut env = spawn_env(adapter, runner, 30);
    env.start();

    let first = env.manager.create(PROVIDER, params(1)).await.unwrap();
    // Give the single worker a moment to pull the first task off the queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = env.manager.create(PROVIDER, params(1)).await.unwrap();

    let third = env.manager.create(PROVIDER, params(1)).await;
    match third {
        Err(Error::QueueFull) => (),
        other => panic!("expected queue-full, got {:?}", other.map(|t| t.id)),
    }
    // The rejected submission never reached the metadata store.
    let page = env.manager.list(1, 50, None).await.unwrap();
    assert_eq!(page.total, 2);

    gate.add_permits(2);
    wait_terminal(&env.manager, &first.id).await;
    wait_terminal(&env.manager, &second.id).await;

    let fourth = env.manager.create(PROVIDER, params(1)).await.unwrap();
    wait_terminal(&env.manager, &fourth.id).await;

    env.shutdown().await;
}

#[actix_rt::test]
async fn client_delete_cancels_in_flight_work() {
    let adapter = StubAdapter::new(vec![
        Step::Produce,
        Step::Produce,
        Step::Sleep(Duration::from_secs(30)),
    ]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 30);

    let task = env.manager.create(PROVIDER, params(5)).await.unwrap();
    let mut receiver = match env.manager.subscribe(&task.id).await.unwrap() {
        Subscription::Live(receiver) => receiver,
        Subscription::Final(event) => panic!("unexpected early final: {:?}", event),
    };
    env.start();

    // Wait for two landed images before pulling the plug.
    let mut progressed = 0;
    while progressed < 2 {
        match tokio::time::timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("event before timeout")
        {
            Ok(ProgressEvent::Progress { completed, .. }) => progressed = completed,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(error) => panic!("stream closed early: {:?}", error),
        }
    }

    env.manager.delete_task(&task.id).await.unwrap();
    // Repeated delete while the cancellation is still in flight: no-op.
    env.manager.delete_task(&task.id).await.unwrap();

    let done = wait_terminal(&env.manager, &task.id).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.error_message.as_deref(), Some("canceled"));
    assert_eq!(done.completed_count, 2);
    assert_eq!(done.images.len(), 2);
    assert!(done
        .images
        .iter()
        .all(|image| image.status == ImageStatus::Success));
    let paths: Vec<String> = done
        .images
        .iter()
        .map(|image| image.path.clone().unwrap())
        .collect();

    // Deleting the already-canceled task again is a no-op: the row and
    // both landed images survive, on disk too.
    env.manager.delete_task(&task.id).await.unwrap();
    let after = env.manager.get(&task.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Failed);
    assert_eq!(after.images.len(), 2);
    for path in &paths {
        assert!(!env.store.read(path).unwrap().is_empty());
    }

    env.shutdown().await;
}

#[actix_rt::test]
async fn deleting_images_cascades_bytes_and_task() {
    let adapter = StubAdapter::new(vec![]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 30);
    env.start();

    let task = env.manager.create(PROVIDER, params(2)).await.unwrap();
    let done = wait_terminal(&env.manager, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let first = done.images[0].clone();
    let second = done.images[1].clone();
    let first_path = first.path.clone().unwrap();

    env.manager.delete_image(&first.id).await.unwrap();
    assert!(env.store.open(&first_path).is_err());
    let remaining = env.manager.get(&task.id).await.unwrap();
    assert_eq!(remaining.images.len(), 1);
    assert_eq!(remaining.total_count, 1);

    // Idempotent: a second delete of the same image is a no-op success.
    env.manager.delete_image(&first.id).await.unwrap();

    env.manager.delete_image(&second.id).await.unwrap();
    match env.manager.get(&task.id).await {
        Err(Error::NotFound(_)) => (),
        other => panic!("expected the empty task to cascade, got {:?}", other.map(|t| t.id)),
    }
    assert!(env.store.open(&second.path.unwrap()).is_err());

    env.shutdown().await;
}

#[actix_rt::test]
async fn late_subscriber_gets_single_synthetic_event() {
    let adapter = StubAdapter::new(vec![]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 0);
    env.start();

    let task = env.manager.create(PROVIDER, params(1)).await.unwrap();
    let done = wait_terminal(&env.manager, &task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    // Grace window is zero; the topic should be gone shortly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    match env.manager.subscribe(&task.id).await.unwrap() {
        Subscription::Final(ProgressEvent::Complete { images_count, .. }) => {
            assert_eq!(images_count, 1)
        }
        Subscription::Final(other) => panic!("unexpected synthetic event: {:?}", other),
        Subscription::Live(_) => panic!("topic should be closed"),
    }

    env.shutdown().await;
}

#[actix_rt::test]
async fn export_flags_missing_entries() {
    let adapter = StubAdapter::new(vec![]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 30);
    env.start();

    let task = env.manager.create(PROVIDER, params(2)).await.unwrap();
    let done = wait_terminal(&env.manager, &task.id).await;

    let mut ids: Vec<String> = done.images.iter().map(|image| image.id.clone()).collect();
    ids.push("missing-image".to_string());

    let (bytes, partial) = env.manager.export(ids).await.unwrap();
    assert!(partial);

    let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(archive.len(), 2);

    env.shutdown().await;
}

#[actix_rt::test]
async fn shutdown_finalizes_in_flight_tasks() {
    let adapter = StubAdapter::new(vec![Step::Sleep(Duration::from_secs(60))]);
    let mut env = spawn_env(adapter, RunnerConfig::default(), 30);
    env.start();

    let task = env.manager.create(PROVIDER, params(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let manager = env.manager.clone();
    env.shutdown().await;

    let done = manager.get(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.error_message.as_deref(), Some("restart"));

    // New submissions are refused once shutdown began.
    match manager.create(PROVIDER, params(1)).await {
        Err(Error::ShuttingDown) => (),
        other => panic!("expected shutdown rejection, got {:?}", other.map(|t| t.id)),
    }
}
