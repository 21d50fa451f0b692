use serde::{Deserialize, Serialize};

use crate::task::Image;

/// Progress events published per task. Terminal events (`complete`,
/// `error`) are always the last event on a topic.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Start { task_id: String, total: u32 },
    #[serde(rename_all = "camelCase")]
    Progress {
        task_id: String,
        completed: u32,
        total: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        image: Option<Image>,
    },
    #[serde(rename_all = "camelCase")]
    Complete { task_id: String, images_count: u32 },
    #[serde(rename_all = "camelCase")]
    Error { task_id: String, message: String },
}

impl ProgressEvent {
    pub fn task_id(&self) -> &str {
        match self {
            ProgressEvent::Start { task_id, .. }
            | ProgressEvent::Progress { task_id, .. }
            | ProgressEvent::Complete { task_id, .. }
            | ProgressEvent::Error { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Complete { .. } | ProgressEvent::Error { .. }
        )
    }

    /// Name used for the `event:` line of the text event stream.
    pub fn event_name(&self) -> &'static str {
        match self {
            ProgressEvent::Start { .. } => "start",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }
}
