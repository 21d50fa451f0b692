use chrono::Utc;
use diesel::prelude::*;

use atelier_persistence::executor::{
    do_with_transaction, readonly_transaction, AsDao, PoolType,
};

use crate::dao::{last_insert_rowid, DaoError, Result};
use crate::db::models::{
    Image as DbImage, ImageStatus as DbImageStatus, Task as DbTask, TaskStatus as DbTaskStatus,
};
use crate::db::schema;

/// Everything persisted at submit time, including the pre-allocated
/// placeholder image identifiers (one per requested output).
#[derive(Clone, Debug)]
pub struct NewTask {
    pub natural_id: String,
    pub prompt: String,
    pub provider_name: String,
    pub model_id: String,
    pub aspect_ratio: String,
    pub image_size: String,
    pub timeout_secs: u32,
    pub config_json: String,
    pub image_ids: Vec<String>,
}

#[derive(Debug)]
pub struct FinalizeOutcome {
    pub task: DbTask,
    pub success_count: i32,
}

pub struct TaskDao<'c> {
    pool: &'c PoolType,
}

impl<'a> AsDao<'a> for TaskDao<'a> {
    fn as_dao(pool: &'a PoolType) -> Self {
        TaskDao { pool }
    }
}

impl<'c> TaskDao<'c> {
    /// Inserts the task row plus its placeholder images in one unit.
    pub async fn create(&self, new: NewTask) -> Result<()> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let now = Utc::now().naive_utc();
        let total = new.image_ids.len() as i32;

        do_with_transaction(self.pool, "task_dao_create", move |conn| {
            diesel::insert_into(dsl::task)
                .values((
                    dsl::natural_id.eq(&new.natural_id),
                    dsl::prompt.eq(&new.prompt),
                    dsl::provider_name.eq(&new.provider_name),
                    dsl::model_id.eq(&new.model_id),
                    dsl::aspect_ratio.eq(&new.aspect_ratio),
                    dsl::image_size.eq(&new.image_size),
                    dsl::timeout_secs.eq(new.timeout_secs as i32),
                    dsl::total_count.eq(total),
                    dsl::completed_count.eq(0),
                    dsl::status_id.eq(DbTaskStatus::Queued),
                    dsl::config_json.eq(&new.config_json),
                    dsl::created_date.eq(now),
                    dsl::updated_date.eq(now),
                ))
                .execute(conn)?;

            let task_row_id: i32 = diesel::select(last_insert_rowid).first(conn)?;

            for (index, image_id) in new.image_ids.iter().enumerate() {
                diesel::insert_into(dsl_image::image)
                    .values((
                        dsl_image::natural_id.eq(image_id),
                        dsl_image::task_id.eq(task_row_id),
                        dsl_image::idx.eq(index as i32),
                        dsl_image::byte_size.eq(0i64),
                        dsl_image::width.eq(0),
                        dsl_image::height.eq(0),
                        dsl_image::status_id.eq(DbImageStatus::Pending),
                        dsl_image::created_date.eq(now),
                    ))
                    .execute(conn)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get(&self, natural_id: &str) -> Result<(DbTask, Vec<DbImage>)> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let natural_id = natural_id.to_owned();
        readonly_transaction(self.pool, "task_dao_get", move |conn| {
            let task: DbTask = dsl::task
                .filter(dsl::natural_id.eq(&natural_id))
                .first(conn)
                .map_err(|e| match e {
                    diesel::NotFound => DaoError::NotFound(format!("task: {}", natural_id)),
                    e => e.into(),
                })?;
            let images: Vec<DbImage> = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .order(dsl_image::idx.asc())
                .load(conn)?;
            Ok((task, images))
        })
        .await
    }

    /// Newest-first page of tasks with their images. `keyword` filters on
    /// the prompt text.
    pub async fn list(
        &self,
        page: i64,
        page_size: i64,
        keyword: Option<String>,
    ) -> Result<(Vec<(DbTask, Vec<DbImage>)>, i64)> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let page = page.max(1);
        let page_size = page_size.clamp(1, 200);

        readonly_transaction(self.pool, "task_dao_list", move |conn| {
            let mut total_query = dsl::task.into_boxed();
            let mut page_query = dsl::task.into_boxed();
            if let Some(keyword) = &keyword {
                let pattern = format!("%{}%", keyword);
                total_query = total_query.filter(dsl::prompt.like(pattern.clone()));
                page_query = page_query.filter(dsl::prompt.like(pattern));
            }

            let total: i64 = total_query.count().get_result(conn)?;
            let tasks: Vec<DbTask> = page_query
                .order((dsl::created_date.desc(), dsl::id.desc()))
                .limit(page_size)
                .offset((page - 1) * page_size)
                .load(conn)?;

            let task_ids: Vec<i32> = tasks.iter().map(|task| task.id).collect();
            let images: Vec<DbImage> = dsl_image::image
                .filter(dsl_image::task_id.eq_any(task_ids))
                .order(dsl_image::idx.asc())
                .load(conn)?;

            let mut by_task: std::collections::HashMap<i32, Vec<DbImage>> =
                std::collections::HashMap::new();
            for image in images {
                by_task.entry(image.task_id).or_default().push(image);
            }
            let rows = tasks
                .into_iter()
                .map(|task| {
                    let mine = by_task.remove(&task.id).unwrap_or_default();
                    (task, mine)
                })
                .collect();
            Ok((rows, total))
        })
        .await
    }

    /// Marks a queued task as picked up. Returns false when the task is
    /// no longer waiting (deleted or already started).
    pub async fn start(&self, natural_id: &str) -> Result<bool> {
        use schema::task::dsl;

        let natural_id = natural_id.to_owned();
        let now = Utc::now().naive_utc();

        do_with_transaction(self.pool, "task_dao_start", move |conn| {
            let updated = diesel::update(
                dsl::task
                    .filter(dsl::natural_id.eq(&natural_id))
                    .filter(dsl::status_id.eq(DbTaskStatus::Queued)),
            )
            .set((
                dsl::status_id.eq(DbTaskStatus::Processing),
                dsl::updated_date.eq(now),
            ))
            .execute(conn)?;
            Ok(updated == 1)
        })
        .await
    }

    /// Writes a terminal status exactly once. Remaining placeholder rows
    /// are dropped in the same unit; counters are recomputed from the
    /// surviving images. Returns `None` when the task is missing or
    /// already terminal.
    pub async fn finalize(
        &self,
        natural_id: &str,
        status: DbTaskStatus,
        error_message: Option<String>,
    ) -> Result<Option<FinalizeOutcome>> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        debug_assert!(status.is_terminal());
        let natural_id = natural_id.to_owned();
        let now = Utc::now().naive_utc();

        do_with_transaction(self.pool, "task_dao_finalize", move |conn| {
            let task: Option<DbTask> = dsl::task
                .filter(dsl::natural_id.eq(&natural_id))
                .first(conn)
                .optional()?;
            let task = match task {
                Some(task) if !task.status_id.is_terminal() => task,
                _ => return Ok(None),
            };

            diesel::delete(
                dsl_image::image
                    .filter(dsl_image::task_id.eq(task.id))
                    .filter(dsl_image::status_id.eq(DbImageStatus::Pending)),
            )
            .execute(conn)?;

            let success_count: i64 = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .filter(dsl_image::status_id.eq(DbImageStatus::Success))
                .count()
                .get_result(conn)?;
            let terminal_count: i64 = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .count()
                .get_result(conn)?;

            diesel::update(dsl::task.filter(dsl::id.eq(task.id)))
                .set((
                    dsl::status_id.eq(status),
                    dsl::error_message.eq(error_message.clone()),
                    dsl::completed_count.eq(terminal_count as i32),
                    dsl::updated_date.eq(now),
                    dsl::completed_date.eq(now),
                ))
                .execute(conn)?;

            let task: DbTask = dsl::task.filter(dsl::id.eq(task.id)).first(conn)?;
            Ok(Some(FinalizeOutcome {
                task,
                success_count: success_count as i32,
            }))
        })
        .await
    }

    /// Removes the task with every image row, returning the relative
    /// byte paths to drop from storage. Missing tasks yield an empty
    /// list so a re-run converges.
    pub async fn delete_cascade(&self, natural_id: &str) -> Result<Vec<String>> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let natural_id = natural_id.to_owned();
        do_with_transaction(self.pool, "task_dao_delete_cascade", move |conn| {
            let task: Option<DbTask> = dsl::task
                .filter(dsl::natural_id.eq(&natural_id))
                .first(conn)
                .optional()?;
            let task = match task {
                Some(task) => task,
                None => return Ok(vec![]),
            };

            let images: Vec<DbImage> = dsl_image::image
                .filter(dsl_image::task_id.eq(task.id))
                .load(conn)?;
            let paths = images
                .iter()
                .flat_map(|image| {
                    image
                        .path
                        .clone()
                        .into_iter()
                        .chain(image.thumb_path.clone())
                })
                .collect();

            diesel::delete(dsl_image::image.filter(dsl_image::task_id.eq(task.id)))
                .execute(conn)?;
            diesel::delete(dsl::task.filter(dsl::id.eq(task.id))).execute(conn)?;
            Ok(paths)
        })
        .await
    }

    /// One-time pass at startup: every task left non-terminal by a
    /// previous process is finalized before new submissions are taken.
    pub async fn reconcile_interrupted(&self, reason: &str) -> Result<Vec<String>> {
        use schema::image::dsl as dsl_image;
        use schema::task::dsl;

        let reason = reason.to_owned();
        let now = Utc::now().naive_utc();

        do_with_transaction(self.pool, "task_dao_reconcile", move |conn| {
            let interrupted: Vec<DbTask> = dsl::task
                .filter(dsl::status_id.eq_any(vec![
                    DbTaskStatus::Queued,
                    DbTaskStatus::Processing,
                ]))
                .load(conn)?;

            let mut finalized = Vec::with_capacity(interrupted.len());
            for task in interrupted {
                diesel::delete(
                    dsl_image::image
                        .filter(dsl_image::task_id.eq(task.id))
                        .filter(dsl_image::status_id.eq(DbImageStatus::Pending)),
                )
                .execute(conn)?;

                let terminal_count: i64 = dsl_image::image
                    .filter(dsl_image::task_id.eq(task.id))
                    .count()
                    .get_result(conn)?;

                diesel::update(dsl::task.filter(dsl::id.eq(task.id)))
                    .set((
                        dsl::status_id.eq(DbTaskStatus::Failed),
                        dsl::error_message.eq(Some(reason.clone())),
                        dsl::completed_count.eq(terminal_count as i32),
                        dsl::updated_date.eq(now),
                        dsl::completed_date.eq(now),
                    ))
                    .execute(conn)?;
                finalized.push(task.natural_id);
            }
            Ok(finalized)
        })
        .await
    }
}
