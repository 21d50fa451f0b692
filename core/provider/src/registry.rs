use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};

use atelier_model::{ProviderConfig, ProviderDescriptor};
use atelier_persistence::executor::DbExecutor;

use crate::adapter::Adapter;
use crate::dao::ProviderConfigDao;
use crate::error::ProviderError;
use crate::gemini::GeminiAdapter;
use crate::openai::OpenAiAdapter;

/// Process-wide map from provider name to its live adapter. Rebuilds are
/// atomic: readers either see the pre-swap or the post-swap map.
pub struct ProviderRegistry {
    adapters: RwLock<Arc<HashMap<String, Arc<dyn Adapter>>>>,
    seed_file: Option<PathBuf>,
}

impl ProviderRegistry {
    pub fn new(seed_file: Option<PathBuf>) -> ProviderRegistry {
        ProviderRegistry {
            adapters: RwLock::new(Arc::new(HashMap::new())),
            seed_file,
        }
    }

    /// Reconstructs the registry from the metadata store and the seed
    /// file. Broken adapters are logged and skipped; one bad entry never
    /// aborts the rebuild.
    pub async fn reload(&self, db: &DbExecutor) -> anyhow::Result<usize> {
        let dao = db.as_dao::<ProviderConfigDao>();
        dao.ensure_defaults(default_configs()).await?;

        if let Some(path) = &self.seed_file {
            if path.exists() {
                match read_seed_file(path) {
                    Ok(seeds) => {
                        dao.ensure_defaults(seeds).await?;
                    }
                    Err(error) => {
                        log::warn!("Ignoring seed file [{}]: {:#}", path.display(), error);
                    }
                }
            }
        }

        let configs = dao.list().await?;
        let mut map: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        for config in configs.into_iter().filter(|config| config.enabled) {
            let name = config.name.clone();
            match build_adapter(config) {
                Ok(adapter) => {
                    log::info!("Added [{}] provider to registry.", name);
                    map.insert(name, adapter);
                }
                Err(error) => {
                    log::warn!("Skipping provider [{}]: {}", name, error);
                }
            }
        }

        let count = map.len();
        *self.adapters.write().unwrap() = Arc::new(map);
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Adapter>, ProviderError> {
        let map = self.adapters.read().unwrap().clone();
        map.get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Stable snapshot suitable for UI listings.
    pub fn list(&self) -> Vec<ProviderDescriptor> {
        let map = self.adapters.read().unwrap().clone();
        let mut descriptors: Vec<_> = map.values().map(|adapter| adapter.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn insert(&self, adapter: Arc<dyn Adapter>) {
        let mut guard = self.adapters.write().unwrap();
        let mut map = (**guard).clone();
        map.insert(adapter.name().to_string(), adapter);
        *guard = Arc::new(map);
    }
}

/// Factory keyed on the provider family.
pub fn build_adapter(config: ProviderConfig) -> Result<Arc<dyn Adapter>, ProviderError> {
    match config.family() {
        "gemini" => Ok(Arc::new(GeminiAdapter::new(config)?)),
        _ => Ok(Arc::new(OpenAiAdapter::new(config)?)),
    }
}

fn read_seed_file(path: &Path) -> anyhow::Result<Vec<ProviderConfig>> {
    let file = File::open(path)
        .with_context(|| format!("can't open provider seed file {}", path.display()))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader)
        .map_err(|error| anyhow!("can't parse provider seed file: {}", error))
}

/// Default upstream entries seeded when absent. Keys come from the
/// conventional environment variables so a fresh install works without
/// touching the config API.
pub fn default_configs() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "gemini".to_string(),
            display_name: "Gemini".to_string(),
            api_base: "https://generativelanguage.googleapis.com".to_string(),
            api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
            extra: None,
            enabled: true,
            timeout_secs: 120,
            max_retries: 3,
        },
        ProviderConfig {
            name: "openai".to_string(),
            display_name: "OpenAI".to_string(),
            api_base: "https://api.openai.com".to_string(),
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            extra: None,
            enabled: true,
            timeout_secs: 120,
            max_retries: 3,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_model::GenerateParams;
    use async_trait::async_trait;
    use std::time::Duration;

    use crate::adapter::{CallCtx, GenerateOutput};

    struct NamedStub(String);

    #[async_trait]
    impl Adapter for NamedStub {
        fn name(&self) -> &str {
            &self.0
        }
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor {
                name: self.0.clone(),
                display_name: self.0.clone(),
                family: "stub".into(),
                enabled: true,
            }
        }
        fn call_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn validate(&self, _params: &GenerateParams) -> crate::Result<()> {
            Ok(())
        }
        async fn generate(
            &self,
            _ctx: &CallCtx,
            _params: &GenerateParams,
        ) -> crate::Result<GenerateOutput> {
            Ok(GenerateOutput::default())
        }
        async fn optimize_prompt(
            &self,
            _ctx: &CallCtx,
            _model: &str,
            _prompt: &str,
            _response_format: Option<&str>,
        ) -> crate::Result<String> {
            Ok("better".into())
        }
    }

    #[test]
    fn unknown_provider_is_signaled() {
        let registry = ProviderRegistry::new(None);
        assert!(matches!(
            registry.get("nope"),
            Err(ProviderError::UnknownProvider(_))
        ));
    }

    #[test]
    fn list_is_sorted_and_stable() {
        let registry = ProviderRegistry::new(None);
        registry.insert(Arc::new(NamedStub("zeta".into())));
        registry.insert(Arc::new(NamedStub("alpha".into())));
        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn factory_dispatches_on_family() {
        let mut config = default_configs().remove(0);
        assert_eq!(config.name, "gemini");
        let adapter = build_adapter(config.clone()).unwrap();
        assert_eq!(adapter.descriptor().family, "gemini");

        config.name = "my-relay".into();
        config.extra = None;
        let adapter = build_adapter(config).unwrap();
        assert_eq!(adapter.descriptor().family, "openai");
    }

    #[test]
    fn concurrent_readers_see_old_or_new_map() {
        let registry = Arc::new(ProviderRegistry::new(None));
        registry.insert(Arc::new(NamedStub("stable".into())));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        // Either map generation must resolve the stable entry.
                        registry.get("stable").unwrap();
                    }
                })
            })
            .collect();

        for generation in 0..100 {
            registry.insert(Arc::new(NamedStub(format!("gen-{}", generation))));
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
