#![allow(clippy::all)]

use chrono::{NaiveDateTime, Utc};
use std::convert::TryFrom;

use atelier_model::ProviderConfig;

use super::schema::*;

#[derive(Queryable, Debug, Clone, Identifiable, Insertable, AsChangeset)]
#[table_name = "provider_config"]
#[primary_key(name)]
pub struct ProviderConfigRecord {
    pub name: String,
    pub display_name: String,
    pub api_base: String,
    pub api_key: String,
    pub extra_json: Option<String>,
    pub enabled: bool,
    pub timeout_secs: i32,
    pub max_retries: i32,
    pub updated_date: NaiveDateTime,
}

impl TryFrom<ProviderConfigRecord> for ProviderConfig {
    type Error = serde_json::Error;

    fn try_from(record: ProviderConfigRecord) -> Result<Self, Self::Error> {
        Ok(ProviderConfig {
            name: record.name,
            display_name: record.display_name,
            api_base: record.api_base,
            api_key: record.api_key,
            extra: record
                .extra_json
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
            enabled: record.enabled,
            timeout_secs: record.timeout_secs.max(0) as u32,
            max_retries: record.max_retries.max(0) as u32,
        })
    }
}

impl From<&ProviderConfig> for ProviderConfigRecord {
    fn from(config: &ProviderConfig) -> Self {
        ProviderConfigRecord {
            name: config.name.clone(),
            display_name: config.display_name.clone(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
            extra_json: config.extra.as_ref().map(|extra| extra.to_string()),
            enabled: config.enabled,
            timeout_secs: config.timeout_secs as i32,
            max_retries: config.max_retries as i32,
            updated_date: Utc::now().naive_utc(),
        }
    }
}
