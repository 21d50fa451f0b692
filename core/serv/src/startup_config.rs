use std::path::PathBuf;

use structopt::StructOpt;

use atelier_task::{RunnerConfig, TaskManagerConfig};

/// How many consecutive ports to try above the configured one before
/// giving up.
pub const PORT_SCAN_RANGE: u16 = 20;

#[derive(StructOpt, Clone, Debug)]
#[structopt(name = "atelierd", about = "Local image generation backend.")]
pub struct StartupConfig {
    /// Data directory holding the metadata store and image files.
    #[structopt(
        long = "data-dir",
        env = "ATELIER_DATA_DIR",
        default_value = "./atelier-data"
    )]
    pub data_dir: PathBuf,
    /// Provider seed file (JSON array of provider configs).
    #[structopt(long = "providers-file", env = "ATELIER_PROVIDERS_FILE")]
    pub providers_file: Option<PathBuf>,
    /// Bind port.
    #[structopt(long = "port", env = "SERVER_PORT", default_value = "8186")]
    pub port: u16,
    /// Bind host. Overrides the container/local bind policy.
    #[structopt(long = "host", env = "SERVER_HOST")]
    pub host: Option<String>,
    /// Exit when stdin reaches EOF (desktop-shell supervision).
    #[structopt(long = "parent-monitor")]
    pub parent_monitor: bool,
    /// Disable thumbnail generation.
    #[structopt(long = "no-thumbnails")]
    pub no_thumbnails: bool,
    /// Remote template catalog URL used by `refresh=true`.
    #[structopt(long = "templates-url", env = "ATELIER_TEMPLATES_URL")]
    pub templates_url: Option<String>,

    #[structopt(flatten)]
    pub runner: RunnerConfig,
    #[structopt(flatten)]
    pub manager: TaskManagerConfig,
}

impl StartupConfig {
    /// Containers bind all interfaces, local runs stay on loopback.
    /// `SERVER_HOST` (or `--host`) wins over both.
    pub fn bind_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        if containerized() {
            "0.0.0.0".to_string()
        } else {
            "127.0.0.1".to_string()
        }
    }
}

pub fn containerized() -> bool {
    if let Ok(value) = std::env::var("ATELIER_CONTAINER") {
        return value == "1" || value.eq_ignore_ascii_case("true");
    }
    std::path::Path::new("/.dockerenv").exists()
}
