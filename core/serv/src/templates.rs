use std::fs;
use std::path::{Path, PathBuf};

use actix_web::{web, Responder};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_model::Envelope;
use atelier_task::Error;

const CACHE_FILE: &str = "templates.json";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CatalogMeta {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TemplateCatalog {
    #[serde(default)]
    pub meta: CatalogMeta,
    #[serde(default)]
    pub items: Vec<TemplateItem>,
}

/// Read-only template catalog: a cached JSON file, optionally refreshed
/// from a remote source on demand. Pure data passthrough.
pub struct TemplateService {
    cache_path: PathBuf,
    remote_url: Option<String>,
    client: reqwest::Client,
}

impl TemplateService {
    pub fn new(data_dir: &Path, remote_url: Option<String>) -> TemplateService {
        TemplateService {
            cache_path: data_dir.join(CACHE_FILE),
            remote_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn catalog(&self, refresh: bool) -> anyhow::Result<TemplateCatalog> {
        if refresh {
            if let Some(url) = &self.remote_url {
                match self.fetch_remote(url).await {
                    Ok(catalog) => {
                        self.store_cache(&catalog)?;
                        return Ok(catalog);
                    }
                    Err(error) => {
                        log::warn!("Template refresh from [{}] failed: {:#}", url, error)
                    }
                }
            }
        }
        self.load_cache()
    }

    async fn fetch_remote(&self, url: &str) -> anyhow::Result<TemplateCatalog> {
        let mut catalog: TemplateCatalog = self
            .client
            .get(url)
            .send()
            .await
            .context("template catalog request failed")?
            .error_for_status()
            .context("template catalog request rejected")?
            .json()
            .await
            .context("template catalog is not valid JSON")?;
        catalog.meta.updated = Some(Utc::now());
        catalog.meta.source = url.to_string();
        Ok(catalog)
    }

    fn load_cache(&self) -> anyhow::Result<TemplateCatalog> {
        if !self.cache_path.exists() {
            return Ok(TemplateCatalog::default());
        }
        let bytes = fs::read(&self.cache_path).with_context(|| {
            format!("can't read template cache {}", self.cache_path.display())
        })?;
        serde_json::from_slice(&bytes).with_context(|| {
            format!("can't parse template cache {}", self.cache_path.display())
        })
    }

    fn store_cache(&self, catalog: &TemplateCatalog) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(catalog)?;
        fs::write(&self.cache_path, json).with_context(|| {
            format!("can't write template cache {}", self.cache_path.display())
        })?;
        Ok(())
    }
}

#[derive(Deserialize, Debug)]
pub struct TemplateQuery {
    #[serde(default)]
    pub refresh: Option<bool>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub keyword: Option<String>,
}

pub fn extend_web_scope(scope: actix_web::Scope) -> actix_web::Scope {
    scope.service(list_templates)
}

#[actix_web::get("/templates")]
async fn list_templates(
    service: web::Data<TemplateService>,
    query: web::Query<TemplateQuery>,
) -> Result<impl Responder, Error> {
    let mut catalog = service
        .catalog(query.refresh.unwrap_or(false))
        .await
        .map_err(|e| Error::Service(format!("template catalog unavailable: {:#}", e)))?;

    if let Some(category) = &query.category {
        catalog
            .items
            .retain(|item| item.category.as_deref() == Some(category.as_str()));
    }
    if let Some(keyword) = &query.keyword {
        let keyword = keyword.to_lowercase();
        catalog.items.retain(|item| {
            item.name.to_lowercase().contains(&keyword)
                || item.prompt.to_lowercase().contains(&keyword)
        });
    }
    Ok(web::Json(Envelope::ok(catalog)))
}
