#![allow(clippy::all)]

use chrono::NaiveDateTime;
use diesel::backend::Backend;
use diesel::deserialize;
use diesel::serialize::Output;
use diesel::sql_types::Integer;
use diesel::types::{FromSql, ToSql};

use super::schema::*;

#[derive(AsExpression, FromSqlRow, PartialEq, Eq, Debug, Clone, Copy)]
#[sql_type = "Integer"]
pub enum TaskStatus {
    Queued = 1,
    Processing = 2,
    Completed = 3,
    Partial = 4,
    Failed = 5,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Partial | TaskStatus::Failed
        )
    }
}

impl<DB: Backend> ToSql<Integer, DB> for TaskStatus
where
    i32: ToSql<Integer, DB>,
{
    fn to_sql<W: std::io::Write>(&self, out: &mut Output<W, DB>) -> diesel::serialize::Result {
        (*self as i32).to_sql(out)
    }
}

impl<DB> FromSql<Integer, DB> for TaskStatus
where
    i32: FromSql<Integer, DB>,
    DB: Backend,
{
    fn from_sql(bytes: Option<&DB::RawValue>) -> deserialize::Result<Self> {
        Ok(match i32::from_sql(bytes)? {
            1 => TaskStatus::Queued,
            2 => TaskStatus::Processing,
            3 => TaskStatus::Completed,
            4 => TaskStatus::Partial,
            5 => TaskStatus::Failed,
            _ => return Err(anyhow::anyhow!("invalid task status").into()),
        })
    }
}

impl From<TaskStatus> for atelier_model::TaskStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Queued => atelier_model::TaskStatus::Queued,
            TaskStatus::Processing => atelier_model::TaskStatus::Processing,
            TaskStatus::Completed => atelier_model::TaskStatus::Completed,
            TaskStatus::Partial => atelier_model::TaskStatus::Partial,
            TaskStatus::Failed => atelier_model::TaskStatus::Failed,
        }
    }
}

#[derive(AsExpression, FromSqlRow, PartialEq, Eq, Debug, Clone, Copy)]
#[sql_type = "Integer"]
pub enum ImageStatus {
    Pending = 1,
    Success = 2,
    Failed = 3,
}

impl ImageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ImageStatus::Pending)
    }
}

impl<DB: Backend> ToSql<Integer, DB> for ImageStatus
where
    i32: ToSql<Integer, DB>,
{
    fn to_sql<W: std::io::Write>(&self, out: &mut Output<W, DB>) -> diesel::serialize::Result {
        (*self as i32).to_sql(out)
    }
}

impl<DB> FromSql<Integer, DB> for ImageStatus
where
    i32: FromSql<Integer, DB>,
    DB: Backend,
{
    fn from_sql(bytes: Option<&DB::RawValue>) -> deserialize::Result<Self> {
        Ok(match i32::from_sql(bytes)? {
            1 => ImageStatus::Pending,
            2 => ImageStatus::Success,
            3 => ImageStatus::Failed,
            _ => return Err(anyhow::anyhow!("invalid image status").into()),
        })
    }
}

impl From<ImageStatus> for atelier_model::ImageStatus {
    fn from(status: ImageStatus) -> Self {
        match status {
            ImageStatus::Pending => atelier_model::ImageStatus::Pending,
            ImageStatus::Success => atelier_model::ImageStatus::Success,
            ImageStatus::Failed => atelier_model::ImageStatus::Failed,
        }
    }
}

#[derive(Queryable, Debug, Clone, Identifiable)]
#[table_name = "task"]
pub struct Task {
    pub id: i32,
    pub natural_id: String,
    pub prompt: String,
    pub provider_name: String,
    pub model_id: String,
    pub aspect_ratio: String,
    pub image_size: String,
    pub timeout_secs: i32,
    pub total_count: i32,
    pub completed_count: i32,
    pub status_id: TaskStatus,
    pub error_message: Option<String>,
    pub config_json: String,
    pub created_date: NaiveDateTime,
    pub updated_date: NaiveDateTime,
    pub completed_date: Option<NaiveDateTime>,
}

#[derive(Queryable, Debug, Clone, Identifiable)]
#[table_name = "image"]
pub struct Image {
    pub id: i32,
    pub natural_id: String,
    pub task_id: i32,
    pub idx: i32,
    pub path: Option<String>,
    pub thumb_path: Option<String>,
    pub byte_size: i64,
    pub width: i32,
    pub height: i32,
    pub mime_type: Option<String>,
    pub status_id: ImageStatus,
    pub created_date: NaiveDateTime,
}

impl Image {
    pub fn into_dto(self, task_natural_id: &str) -> atelier_model::Image {
        atelier_model::Image {
            id: self.natural_id,
            task_id: task_natural_id.to_string(),
            index: self.idx.max(0) as u32,
            path: self.path,
            thumb_path: self.thumb_path,
            byte_size: self.byte_size,
            width: self.width.max(0) as u32,
            height: self.height.max(0) as u32,
            mime_type: self.mime_type,
            status: self.status_id.into(),
            created_at: self.created_date.and_utc(),
        }
    }
}

impl Task {
    pub fn into_dto(self, images: Vec<Image>) -> atelier_model::Task {
        let natural_id = self.natural_id.clone();
        atelier_model::Task {
            id: self.natural_id,
            prompt: self.prompt,
            provider: self.provider_name,
            model_id: self.model_id,
            aspect_ratio: self.aspect_ratio,
            image_size: self.image_size,
            timeout_secs: self.timeout_secs.max(0) as u32,
            total_count: self.total_count.max(0) as u32,
            completed_count: self.completed_count.max(0) as u32,
            status: self.status_id.into(),
            error_message: self.error_message,
            config: serde_json::from_str(&self.config_json)
                .unwrap_or(serde_json::Value::Null),
            created_at: self.created_date.and_utc(),
            updated_at: self.updated_date.and_utc(),
            completed_at: self.completed_date.map(|date| date.and_utc()),
            images: images
                .into_iter()
                .map(|image| image.into_dto(&natural_id))
                .collect(),
        }
    }
}
