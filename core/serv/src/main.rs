mod api;
mod startup_config;
mod templates;

use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;

use actix_web::middleware::Logger;
use actix_web::{App, HttpServer};
use anyhow::{bail, Context};
use structopt::StructOpt;

use atelier_persistence::executor::DbExecutor;
use atelier_provider::ProviderRegistry;
use atelier_storage::LocalStore;
use atelier_task::{TaskManager, WorkerPool};

use crate::startup_config::{StartupConfig, PORT_SCAN_RANGE};
use crate::templates::TemplateService;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = StartupConfig::from_args();
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("can't create data directory {}", config.data_dir.display())
    })?;
    let data_dir = config
        .data_dir
        .canonicalize()
        .context("can't resolve data directory")?;
    log::info!("Starting atelierd in [{}].", data_dir.display());

    let db = DbExecutor::from_data_dir(&data_dir, "atelier")
        .context("can't open the metadata store")?;
    atelier_provider::run_migrations(&db).context("provider migrations failed")?;
    atelier_task::run_migrations(&db).context("task migrations failed")?;

    let store = LocalStore::new(&data_dir.join("storage"), !config.no_thumbnails)
        .context("can't prepare the image store")?;

    let registry = Arc::new(ProviderRegistry::new(config.providers_file.clone()));
    let adapters = registry
        .reload(&db)
        .await
        .context("provider registry hydration failed")?;
    log::info!("Provider registry ready with {} adapter(s).", adapters);

    let mut manager_config = config.manager.clone();
    if manager_config.ref_root.is_none() {
        manager_config.ref_root = Some(data_dir.clone());
    }
    let (manager, queue) = TaskManager::new(
        db.clone(),
        store.clone(),
        registry.clone(),
        &manager_config,
        config.runner.queue_capacity,
    );

    // Interrupted tasks are finalized before the listener binds.
    let reconciled = manager
        .reconcile()
        .await
        .context("startup reconciliation failed")?;
    if reconciled > 0 {
        log::warn!("{} task(s) reconciled after restart.", reconciled);
    }

    let pool = WorkerPool::spawn(manager.clone(), queue, &config.runner);
    let templates_service = Arc::new(TemplateService::new(
        &data_dir,
        config.templates_url.clone(),
    ));

    let host = config.bind_host();
    let listener = scan_port(&host, config.port, PORT_SCAN_RANGE)?;
    let local_addr = listener.local_addr()?;
    log::info!("Listening on http://{}", local_addr);

    let storage_root = store.root().to_path_buf();
    let db_for_app = db.clone();
    let registry_for_app = registry.clone();
    let manager_for_app = manager.clone();
    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .service(api::web_scope(
                &db_for_app,
                &registry_for_app,
                &manager_for_app,
                &templates_service,
            ))
            .service(
                actix_files::Files::new(atelier_model::STORAGE_API_PATH, storage_root.clone())
                    .use_etag(true),
            )
    })
    .listen(listener)?
    .shutdown_timeout(config.runner.shutdown_grace_secs)
    .run();

    if config.parent_monitor {
        spawn_parent_monitor(server.handle());
    }

    server.await.context("http server failed")?;
    log::info!("Server stopped, draining workers.");
    pool.shutdown(&manager).await;
    Ok(())
}

/// Binds the first free port in `[base, base + range)`. Running out of
/// ports is an unrecoverable init failure.
fn scan_port(host: &str, base: u16, range: u16) -> anyhow::Result<TcpListener> {
    let top = base.saturating_add(range);
    for port in base..top {
        match TcpListener::bind((host, port)) {
            Ok(listener) => {
                if port != base {
                    log::warn!("Port {} was taken, bound {} instead.", base, port);
                }
                listener.set_nonblocking(true)?;
                return Ok(listener);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e).with_context(|| format!("can't bind {}:{}", host, port)),
        }
    }
    bail!("no free port in {}..{} on {}", base, top, host)
}

/// Desktop-shell supervision: the parent holds our stdin open and we
/// stop as soon as it goes away.
fn spawn_parent_monitor(handle: actix_web::dev::ServerHandle) {
    std::thread::spawn(move || {
        let mut buffer = [0u8; 256];
        let mut stdin = std::io::stdin();
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        log::info!("Parent process went away, shutting down.");
        futures::executor::block_on(handle.stop(true));
    });
}
