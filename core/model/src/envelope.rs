use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Uniform response body for every JSON endpoint. `code == 0` is
/// success; non-zero codes come from `ErrorKind::code`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Envelope {
            code: 0,
            message: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Envelope {
            code: kind.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_carries_data() {
        let envelope = Envelope::ok(serde_json::json!({ "status": "ok" }));
        assert!(envelope.is_ok());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["code"], 0);
        assert_eq!(json["data"]["status"], "ok");
    }

    #[test]
    fn failure_envelope_has_no_data() {
        let envelope: Envelope<()> = Envelope::failure(ErrorKind::QueueFull, "queue saturated");
        assert!(!envelope.is_ok());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["code"], 1002);
        assert!(json.get("data").is_none());
    }
}
