/// Wire and data models shared across Vidrelay crates.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope code for a successful call.
pub const CODE_SUCCESS: i32 = 200;
/// Envelope code for a failed call.
pub const CODE_ERROR: i32 = 500;

/// Structured response envelope: `{ "code", "msg", "data" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResult<T = serde_json::Value> {
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: CODE_SUCCESS,
            msg: "success".to_string(),
            data: Some(data),
        }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            msg: msg.into(),
            data: None,
        }
    }

    /// Failure that still carries a payload (e.g. a pending login status).
    pub fn fail_with(msg: impl Into<String>, data: T) -> Self {
        Self {
            code: CODE_ERROR,
            msg: msg.into(),
            data: Some(data),
        }
    }
}

/// One progress tick pushed to the live subscriber.
///
/// `progress` is conventionally 0.0..=100.0 but is not clamped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub progress: f64,
}

impl ProgressEvent {
    pub fn new(file_name: impl Into<String>, progress: f64) -> Self {
        Self {
            file_name: file_name.into(),
            progress,
        }
    }

    /// Serialize to a single text frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Login credentials persisted after a confirmed QR scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(rename = "SESSDATA", default)]
    pub sess_data: String,
    #[serde(default)]
    pub bili_jct: String,
    #[serde(rename = "DedeUserID", default)]
    pub dede_user_id: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.sess_data.is_empty()
    }

    /// Copy safe for display: SESSDATA cut to its first 10 chars.
    pub fn masked(&self) -> Self {
        let mut shown = self.clone();
        if shown.sess_data.chars().count() > 10 {
            let head: String = shown.sess_data.chars().take(10).collect();
            shown.sess_data = format!("{}...", head);
        }
        shown
    }
}

/// QR code issued for scan-to-login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QrCode {
    pub url: String,
    pub qrcode_key: String,
}

/// Result of polling a QR code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QrStatus {
    /// Platform status: 0 confirmed, 86101 not scanned, 86090 scanned, 86038 expired.
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl QrStatus {
    pub fn is_confirmed(&self) -> bool {
        self.code == 0
    }
}

/// Playable media resolved from a video identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVideo {
    pub title: String,
    pub bvid: String,
    pub cid: u64,
    pub video_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}
