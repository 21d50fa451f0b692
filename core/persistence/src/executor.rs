use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::Connection;
use diesel::SqliteConnection;

pub type InnerConnType = SqliteConnection;
pub type ConnType = PooledConnection<ConnectionManager<InnerConnType>>;
pub type PoolType = Pool<ConnectionManager<InnerConnType>>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Diesel error: {0}")]
    DieselError(#[from] diesel::result::Error),
    #[error("Pool error: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("Runtime error: {0}")]
    RuntimeError(#[from] tokio::task::JoinError),
    #[error("Serde Json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("Migration error: {0}")]
    MigrationError(#[from] diesel_migrations::RunMigrationsError),
}

/// Pooled sqlite executor shared by every DAO in the process.
#[derive(Clone)]
pub struct DbExecutor {
    pub pool: PoolType,
}

impl DbExecutor {
    pub fn new<S: Into<String>>(database_url: S) -> Result<Self, Error> {
        let manager = ConnectionManager::new(database_url);
        let pool = Pool::builder().build(manager)?;
        Ok(DbExecutor { pool })
    }

    /// Opens (creating if needed) the single store file inside `data_dir`.
    pub fn from_data_dir(data_dir: &Path, name: &str) -> Result<Self, Error> {
        let url = data_dir.join(format!("{}.db", name));
        Self::new(url.to_string_lossy().to_string())
    }

    pub fn conn(&self) -> Result<ConnType, Error> {
        let conn = self.pool.get()?;
        conn.batch_execute(
            "PRAGMA synchronous = NORMAL; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    pub fn as_dao<'a, T: AsDao<'a>>(&'a self) -> T {
        AsDao::as_dao(&self.pool)
    }

    /// Runs an embedded migration set produced by `embed_migrations!`.
    pub fn apply_migration<T, E: Into<Error>>(
        &self,
        migration: fn(&ConnType, &mut dyn std::io::Write) -> Result<T, E>,
    ) -> Result<(), Error> {
        let conn = self.conn()?;
        migration(&conn, &mut std::io::sink()).map_err(Into::into)?;
        Ok(())
    }
}

pub trait AsDao<'a> {
    fn as_dao(pool: &'a PoolType) -> Self;
}

/// Runs `f` inside a write transaction on a blocking thread. The closure
/// error type only needs the conversions every DAO error carries anyway.
pub async fn do_with_transaction<R, E, F>(
    pool: &PoolType,
    label: &'static str,
    f: F,
) -> Result<R, E>
where
    R: Send + 'static,
    E: Send
        + 'static
        + From<tokio::task::JoinError>
        + From<r2d2::Error>
        + From<diesel::result::Error>,
    F: FnOnce(&ConnType) -> Result<R, E> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        conn.batch_execute(
            "PRAGMA synchronous = NORMAL; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
        )?;
        log::trace!("tx:{}", label);
        conn.transaction(|| f(&conn))
    })
    .await?
}

/// Like `do_with_transaction` but the closure promises not to write.
pub async fn readonly_transaction<R, E, F>(
    pool: &PoolType,
    label: &'static str,
    f: F,
) -> Result<R, E>
where
    R: Send + 'static,
    E: Send
        + 'static
        + From<tokio::task::JoinError>
        + From<r2d2::Error>
        + From<diesel::result::Error>,
    F: FnOnce(&ConnType) -> Result<R, E> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        log::trace!("ro:{}", label);
        f(&conn)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::dsl::sql;
    use diesel::prelude::*;
    use diesel::sql_types::BigInt;
    use tempdir::TempDir;

    fn db() -> (TempDir, DbExecutor) {
        let dir = TempDir::new("atelier-persistence").unwrap();
        let db = DbExecutor::from_data_dir(dir.path(), "test").unwrap();
        let conn = db.conn().unwrap();
        conn.batch_execute("CREATE TABLE t (x INTEGER NOT NULL);")
            .unwrap();
        (dir, db)
    }

    fn count(conn: &ConnType) -> i64 {
        diesel::select(sql::<BigInt>("(SELECT count(*) FROM t)"))
            .first(conn)
            .unwrap()
    }

    #[tokio::test]
    async fn transaction_commits() {
        let (_dir, db) = db();
        do_with_transaction::<_, Error, _>(&db.pool, "test_commit", |conn| {
            conn.batch_execute("INSERT INTO t VALUES (1); INSERT INTO t VALUES (2);")?;
            Ok(())
        })
        .await
        .unwrap();

        let total =
            readonly_transaction::<_, Error, _>(&db.pool, "test_read", |conn| Ok(count(conn)))
                .await
                .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let (_dir, db) = db();
        let result: Result<(), Error> = do_with_transaction::<_, Error, _>(&db.pool, "test_rollback", |conn| {
            conn.batch_execute("INSERT INTO t VALUES (1);")?;
            Err(Error::DieselError(diesel::result::Error::RollbackTransaction))
        })
        .await;
        assert!(result.is_err());

        let total =
            readonly_transaction::<_, Error, _>(&db.pool, "test_read", |conn| Ok(count(conn)))
                .await
                .unwrap();
        assert_eq!(total, 0);
    }
}
