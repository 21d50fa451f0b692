use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Error kinds distinguished by the core, stable across transports.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    InvalidParams,
    QueueFull,
    UpstreamTransient,
    UpstreamRefused,
    IoError,
    Canceled,
    Restart,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Stable envelope code for UI logic to branch on.
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::InvalidParams => 1001,
            ErrorKind::QueueFull => 1002,
            ErrorKind::UpstreamTransient => 1010,
            ErrorKind::UpstreamRefused => 1011,
            ErrorKind::IoError => 1020,
            ErrorKind::Canceled => 1030,
            ErrorKind::Restart => 1031,
            ErrorKind::NotFound => 1404,
            ErrorKind::Internal => 1500,
        }
    }

    /// Whether an adapter is allowed to retry an operation failing
    /// with this kind.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::UpstreamTransient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn kinds_have_stable_kebab_names() {
        assert_eq!(ErrorKind::InvalidParams.to_string(), "invalid-params");
        assert_eq!(ErrorKind::QueueFull.to_string(), "queue-full");
        assert_eq!(
            ErrorKind::from_str("upstream-transient").unwrap(),
            ErrorKind::UpstreamTransient
        );
    }

    #[test]
    fn only_transient_kind_retries() {
        assert!(ErrorKind::UpstreamTransient.is_transient());
        assert!(!ErrorKind::UpstreamRefused.is_transient());
        assert!(!ErrorKind::InvalidParams.is_transient());
        assert!(!ErrorKind::IoError.is_transient());
    }
}
