use chrono::Utc;
use diesel::prelude::*;

use atelier_persistence::executor::{
    do_with_transaction, readonly_transaction, AsDao, PoolType,
};

use crate::dao::{DaoError, Result};
use crate::db::models::{
    Image as DbImage, ImageStatus as DbImageStatus, Task as DbTask,
};
use crate::db::schema;

/// Everything recorded when bytes land (or fail to land) for one slot.
#[derive(Clone, Debug, Default)]
pub struct LandedImage {
    pub path: Option<String>,
    pub thumb_path: Option<String>,
    pub byte_size: i64,
    pub width: i32,
    pub height: i32,
    pub mime_type: Option<String>,
}

#[derive(Debug)]
pub struct ImageDeletion {
    pub paths: Vec<String>,
    pub task_natural_id: String,
    pub task_empty: bool,
}

pub struct ImageDao<'c> {
    pool: &'c PoolType,
}

impl<'a> AsDao<'a> for ImageDao<'a> {
    fn as_dao(pool: &'a PoolType) -> Self {
        ImageDao { pool }
    }
}

impl<'c> ImageDao<'c> {
    /// Upgrades the placeholder at (task, idx) to a terminal state and
    /// refreshes the task counters in the same unit. Returns the updated
    /// row plus the new completed count.
    pub async fn record(
        &self,
        task_natural_id: &str,
        idx: u32,
        status: DbImageStatus,
        landed: LandedImage,
    ) -> Result<(DbImage, i32)> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        debug_assert!(status.is_terminal());
        let task_natural_id = task_natural_id.to_owned();
        let now = Utc::now().naive_utc();

        do_with_transaction(self.pool, "image_dao_record", move |conn| {
            let task: DbTask = dsl::task
                .filter(dsl::natural_id.eq(&task_natural_id))
                .first(conn)
                .map_err(|e| match e {
                    diesel::NotFound => {
                        DaoError::NotFound(format!("task: {}", task_natural_id))
                    }
                    e => e.into(),
                })?;

            let updated = diesel::update(
                dsl_image::image
                    .filter(dsl_image::task_id.eq(task.id))
                    .filter(dsl_image::idx.eq(idx as i32)),
            )
            .set((
                dsl_image::path.eq(landed.path.clone()),
                dsl_image::thumb_path.eq(landed.thumb_path.clone()),
                dsl_image::byte_size.eq(landed.byte_size),
                dsl_image::width.eq(landed.width),
                dsl_image::height.eq(landed.height),
                dsl_image::mime_type.eq(landed.mime_type.clone()),
                dsl_image::status_id.eq(status),
            ))
            .execute(conn)?;
            if updated != 1 {
                return Err(DaoError::NotFound(format!(
                    "image slot {} of task {}",
                    idx, task_natural_id
                )));
            }

            let completed: i64 = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .filter(dsl_image::status_id.ne(DbImageStatus::Pending))
                .count()
                .get_result(conn)?;

            diesel::update(dsl::task.filter(dsl::id.eq(task.id)))
                .set((
                    dsl::completed_count.eq(completed as i32),
                    dsl::updated_date.eq(now),
                ))
                .execute(conn)?;

            let image: DbImage = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .filter(dsl_image::idx.eq(idx as i32))
                .first(conn)?;
            Ok((image, completed as i32))
        })
        .await
    }

    pub async fn find(&self, natural_id: &str) -> Result<(DbImage, DbTask)> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let natural_id = natural_id.to_owned();
        readonly_transaction(self.pool, "image_dao_find", move |conn| {
            let image: DbImage = dsl_image::image
                .filter(dsl_image::natural_id.eq(&natural_id))
                .first(conn)
                .map_err(|e| match e {
                    diesel::NotFound => DaoError::NotFound(format!("image: {}", natural_id)),
                    e => e.into(),
                })?;
            let task: DbTask = dsl::task.filter(dsl::id.eq(image.task_id)).first(conn)?;
            Ok((image, task))
        })
        .await
    }

    /// Drops one image row, refreshing the owning task's counters.
    /// `task_empty` tells the caller to cascade the whole task. Missing
    /// images return `None` so re-runs are no-op successes.
    pub async fn delete(&self, natural_id: &str) -> Result<Option<ImageDeletion>> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let natural_id = natural_id.to_owned();
        let now = Utc::now().naive_utc();

        do_with_transaction(self.pool, "image_dao_delete", move |conn| {
            let image: Option<DbImage> = dsl_image::image
                .filter(dsl_image::natural_id.eq(&natural_id))
                .first(conn)
                .optional()?;
            let image = match image {
                Some(image) => image,
                None => return Ok(None),
            };
            let task: DbTask = dsl::task.filter(dsl::id.eq(image.task_id)).first(conn)?;

            diesel::delete(dsl_image::image.filter(dsl_image::id.eq(image.id)))
                .execute(conn)?;

            let remaining: i64 = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .count()
                .get_result(conn)?;
            let completed: i64 = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .filter(dsl_image::status_id.ne(DbImageStatus::Pending))
                .count()
                .get_result(conn)?;

            diesel::update(dsl::task.filter(dsl::id.eq(task.id)))
                .set((
                    dsl::total_count.eq(remaining as i32),
                    dsl::completed_count.eq(completed as i32),
                    dsl::updated_date.eq(now),
                ))
                .execute(conn)?;

            let paths = image
                .path
                .into_iter()
                .chain(image.thumb_path.into_iter())
                .collect();
            Ok(Some(ImageDeletion {
                paths,
                task_natural_id: task.natural_id,
                task_empty: remaining == 0,
            }))
        })
        .await
    }
}
