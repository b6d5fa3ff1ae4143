//! Device status reported by status hooks and cached under
//! [`STATUS_PARAM`].

use serde::{Deserialize, Serialize};

/// Cache key under which the last status is kept.
pub const STATUS_PARAM: &str = "status";

/// Coarse device condition, ordered from best to worst.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    /// Idle and ready
    Ok,
    /// Working, but something needs attention
    Warn,
    /// Moving or otherwise occupied
    Busy,
    /// Hardware reports a fault
    Error,
    /// The type cannot tell
    Unknown,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Ok => "ok",
            StatusCode::Warn => "warn",
            StatusCode::Busy => "busy",
            StatusCode::Error => "error",
            StatusCode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: StatusCode,
    pub text: String,
}

impl DeviceStatus {
    pub fn new(code: StatusCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn ok(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok, text)
    }

    pub fn busy(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Busy, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(StatusCode::Error, text)
    }

    /// Worth a line in an info snapshot.
    pub fn is_notable(&self) -> bool {
        !matches!(self.code, StatusCode::Ok | StatusCode::Unknown)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.text.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.text)
        }
    }
}
