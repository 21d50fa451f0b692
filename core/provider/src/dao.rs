use std::convert::TryInto;

use diesel::prelude::*;
use thiserror::Error;

use atelier_model::ProviderConfig;
use atelier_persistence::executor::{
    do_with_transaction, readonly_transaction, AsDao, PoolType,
};

use crate::db::models::ProviderConfigRecord;
use crate::db::schema;

pub type Result<T> = std::result::Result<T, DaoError>;

#[derive(Error, Debug)]
pub enum DaoError {
    #[error("Diesel error: {0}")]
    DieselError(#[from] diesel::result::Error),
    #[error("Runtime error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
    #[error("Pool error: {0}")]
    R2D2Error(#[from] r2d2::Error),
    #[error("Serde Json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Provider not found: {0}")]
    NotFound(String),
}

pub struct ProviderConfigDao<'c> {
    pool: &'c PoolType,
}

impl<'a> AsDao<'a> for ProviderConfigDao<'a> {
    fn as_dao(pool: &'a PoolType) -> Self {
        ProviderConfigDao { pool }
    }
}

impl<'c> ProviderConfigDao<'c> {
    /// Inserts entries that are not present yet; existing rows win.
    pub async fn ensure_defaults(&self, defaults: Vec<ProviderConfig>) -> Result<usize> {
        use schema::provider_config::dsl;

        let records: Vec<ProviderConfigRecord> =
            defaults.iter().map(ProviderConfigRecord::from).collect();

        do_with_transaction(self.pool, "provider_config_ensure_defaults", move |conn| {
            let mut inserted = 0;
            for record in records {
                inserted += diesel::insert_or_ignore_into(dsl::provider_config)
                    .values(&record)
                    .execute(conn)?;
            }
            Ok(inserted)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<ProviderConfig>> {
        use schema::provider_config::dsl;

        readonly_transaction(self.pool, "provider_config_list", move |conn| {
            let records: Vec<ProviderConfigRecord> = dsl::provider_config
                .order(dsl::name.asc())
                .load(conn)?;
            records
                .into_iter()
                .map(|record| record.try_into().map_err(DaoError::from))
                .collect()
        })
        .await
    }

    pub async fn get(&self, name: &str) -> Result<ProviderConfig> {
        use schema::provider_config::dsl;

        let name = name.to_owned();
        readonly_transaction(self.pool, "provider_config_get", move |conn| {
            let record: ProviderConfigRecord = dsl::provider_config
                .filter(dsl::name.eq(&name))
                .first(conn)
                .map_err(|e| match e {
                    diesel::NotFound => DaoError::NotFound(name.clone()),
                    e => e.into(),
                })?;
            Ok(record.try_into()?)
        })
        .await
    }

    pub async fn upsert(&self, config: &ProviderConfig) -> Result<()> {
        use schema::provider_config::dsl;

        let record = ProviderConfigRecord::from(config);
        do_with_transaction(self.pool, "provider_config_upsert", move |conn| {
            diesel::replace_into(dsl::provider_config)
                .values(&record)
                .execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_persistence::executor::DbExecutor;
    use tempdir::TempDir;

    fn db() -> (TempDir, DbExecutor) {
        let dir = TempDir::new("atelier-provider-dao").unwrap();
        let db = DbExecutor::from_data_dir(dir.path(), "test").unwrap();
        crate::run_migrations(&db).unwrap();
        (dir, db)
    }

    fn config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            display_name: name.to_uppercase(),
            api_base: "http://upstream".into(),
            api_key: "key".into(),
            extra: Some(serde_json::json!({ "family": "openai" })),
            enabled: true,
            timeout_secs: 60,
            max_retries: 2,
        }
    }

    #[actix_rt::test]
    async fn defaults_do_not_overwrite_existing() {
        let (_dir, db) = db();
        let dao = db.as_dao::<ProviderConfigDao>();

        let mut original = config("gemini");
        original.api_key = "user-key".into();
        dao.upsert(&original).await.unwrap();

        dao.ensure_defaults(vec![config("gemini"), config("openai")])
            .await
            .unwrap();

        let kept = dao.get("gemini").await.unwrap();
        assert_eq!(kept.api_key, "user-key");
        assert!(dao.get("openai").await.is_ok());
    }

    #[actix_rt::test]
    async fn upsert_replaces_by_name() {
        let (_dir, db) = db();
        let dao = db.as_dao::<ProviderConfigDao>();

        dao.upsert(&config("relay")).await.unwrap();
        let mut updated = config("relay");
        updated.timeout_secs = 5;
        updated.enabled = false;
        dao.upsert(&updated).await.unwrap();

        let rows = dao.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timeout_secs, 5);
        assert!(!rows[0].enabled);
    }

    #[actix_rt::test]
    async fn missing_provider_is_not_found() {
        let (_dir, db) = db();
        let dao = db.as_dao::<ProviderConfigDao>();
        assert!(matches!(
            dao.get("ghost").await,
            Err(DaoError::NotFound(_))
        ));
    }
}
