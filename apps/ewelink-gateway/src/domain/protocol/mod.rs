//! eWeLink Protocol Frames
//!
//! JSON frame helpers for both sides of the gateway: replies to devices,
//! commands to devices, and frames sent to the vendor cloud.
//!
//! # Sections
//!
//! - **Field access**: typed readers over raw `serde_json::Value` frames
//! - **Key substitution**: parse, mutate, serialize (never string splicing)
//! - **Local replies**: register, update ack, query, date
//! - **Cloud frames**: registration, heartbeat, device update, app ack
//! - **Classification**: what a cloud frame means for the session
//! - **Dispatch**: HTTP dispatch request and response bodies

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::domain::device::SwitchState;

// =============================================================================
// Constants
// =============================================================================

/// Heartbeat flag announced in the register reply.
pub const REGISTER_HB: u64 = 1;

/// Heartbeat interval (seconds) announced in the register reply.
pub const REGISTER_HB_INTERVAL: u64 = 145;

/// `userAgent` of device-originated frames.
pub const USER_AGENT_DEVICE: &str = "device";

/// `userAgent` of app-originated frames.
pub const USER_AGENT_APP: &str = "app";

// =============================================================================
// Actions
// =============================================================================

/// The `action` field of a protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Device registration.
    Register,
    /// State change (either direction).
    Update,
    /// State query, also used as cloud heartbeat.
    Query,
    /// Time request.
    Date,
    /// Anything else.
    Other(String),
}

impl Action {
    /// Parse the `action` field of a frame.
    #[must_use]
    pub fn of(frame: &Value) -> Option<Self> {
        frame.get("action").and_then(Value::as_str).map(Self::from)
    }

    /// Label for metrics and logs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Register => "register",
            Self::Update => "update",
            Self::Query => "query",
            Self::Date => "date",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for Action {
    fn from(value: &str) -> Self {
        match value {
            "register" => Self::Register,
            "update" => Self::Update,
            "query" => Self::Query,
            "date" => Self::Date,
            other => Self::Other(other.to_string()),
        }
    }
}

// =============================================================================
// Field Access
// =============================================================================

/// Non-empty `deviceid` field.
#[must_use]
pub fn device_id_of(frame: &Value) -> Option<&str> {
    frame
        .get("deviceid")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Non-empty `apikey` field.
#[must_use]
pub fn apikey_of(frame: &Value) -> Option<&str> {
    frame
        .get("apikey")
        .and_then(Value::as_str)
        .filter(|key| !key.is_empty())
}

/// `params.switch`, if it names a known state.
#[must_use]
pub fn switch_param(frame: &Value) -> Option<SwitchState> {
    frame
        .get("params")
        .and_then(|params| params.get("switch"))
        .and_then(Value::as_str)
        .and_then(SwitchState::from_param)
}

/// `params.deviceName`, if present and non-empty.
#[must_use]
pub fn device_name_param(frame: &Value) -> Option<&str> {
    frame
        .get("params")
        .and_then(|params| params.get("deviceName"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// The `error` field as a number.
///
/// Devices and the cloud send it as an integer; a numeric string is accepted.
#[must_use]
pub fn error_code(frame: &Value) -> Option<i64> {
    match frame.get("error")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The `sequence` field, as a string.
#[must_use]
pub fn sequence_of(frame: &Value) -> Option<String> {
    match frame.get("sequence")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whether a device frame is the result of a command (`error:0`,
/// a `sequence`, and no `action`).
#[must_use]
pub fn is_command_result(frame: &Value) -> bool {
    frame.get("action").is_none() && error_code(frame) == Some(0) && sequence_of(frame).is_some()
}

// =============================================================================
// Sequence Numbers
// =============================================================================

static LAST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Fresh millisecond-timestamp sequence.
///
/// Strictly increasing within the process even when called twice in the same
/// millisecond.
#[must_use]
pub fn new_sequence() -> String {
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let mut last = LAST_SEQUENCE.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_SEQUENCE.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next.to_string(),
            Err(observed) => last = observed,
        }
    }
}

// =============================================================================
// Key Substitution
// =============================================================================

/// Replace the `apikey` field of a frame object. Non-object frames are left
/// untouched and `false` is returned.
pub fn substitute_apikey(frame: &mut Value, apikey: &str) -> bool {
    frame.as_object_mut().is_some_and(|object| {
        object.insert("apikey".to_string(), Value::String(apikey.to_string()));
        true
    })
}

/// Replace the `sequence` field of a frame object.
pub fn set_sequence(frame: &mut Value, sequence: String) {
    if let Some(object) = frame.as_object_mut() {
        object.insert("sequence".to_string(), Value::String(sequence));
    }
}

// =============================================================================
// Local Replies
// =============================================================================

/// Reply to a device `register` frame.
#[must_use]
pub fn register_reply(device_id: &str, local_apikey: &str) -> Value {
    json!({
        "error": 0,
        "deviceid": device_id,
        "apikey": local_apikey,
        "config": {
            "hb": REGISTER_HB,
            "hbInterval": REGISTER_HB_INTERVAL,
        },
    })
}

/// Ack for a device `update` frame.
#[must_use]
pub fn ack(device_id: &str, local_apikey: &str) -> Value {
    json!({
        "error": 0,
        "deviceid": device_id,
        "apikey": local_apikey,
    })
}

/// Reply to a device `query` frame.
#[must_use]
pub fn query_reply(device_id: &str, local_apikey: &str, switch: SwitchState) -> Value {
    let params = switch
        .as_param()
        .map_or_else(|| json!({}), |state| json!({ "switch": state }));
    json!({
        "error": 0,
        "deviceid": device_id,
        "apikey": local_apikey,
        "params": params,
    })
}

/// Reply to a device `date` frame (ISO-8601 UTC, millisecond precision).
#[must_use]
pub fn date_reply(device_id: &str, local_apikey: &str) -> Value {
    json!({
        "error": 0,
        "deviceid": device_id,
        "apikey": local_apikey,
        "date": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// App-originated `update` command sent to a device.
#[must_use]
pub fn app_update(device_id: &str, local_apikey: &str, switch: &str, sequence: String) -> Value {
    json!({
        "action": "update",
        "deviceid": device_id,
        "apikey": local_apikey,
        "userAgent": USER_AGENT_APP,
        "sequence": sequence,
        "ts": 0,
        "params": { "switch": switch },
        "from": USER_AGENT_APP,
    })
}

// =============================================================================
// Cloud Frames
// =============================================================================

/// Device metadata used when no `register` frame was captured.
#[derive(Debug, Clone)]
pub struct RegisterDefaults<'a> {
    /// Protocol version.
    pub version: u32,
    /// Firmware version.
    pub rom_version: &'a str,
    /// Hardware model.
    pub model: &'a str,
}

/// Registration frame for the cloud.
///
/// Reuses the captured device frame when there is one; the real apikey and
/// a fresh sequence are always set.
#[must_use]
pub fn cloud_register(
    captured: Option<&Value>,
    device_id: &str,
    apikey: &str,
    defaults: &RegisterDefaults<'_>,
) -> Value {
    let sequence = new_sequence();
    if let Some(mut frame) = captured.filter(|frame| frame.is_object()).cloned() {
        substitute_apikey(&mut frame, apikey);
        set_sequence(&mut frame, sequence);
        return frame;
    }
    json!({
        "action": "register",
        "deviceid": device_id,
        "apikey": apikey,
        "userAgent": USER_AGENT_DEVICE,
        "sequence": sequence,
        "ts": 0,
        "version": defaults.version,
        "romVersion": defaults.rom_version,
        "model": defaults.model,
    })
}

/// Application-level heartbeat sent to the cloud.
#[must_use]
pub fn cloud_heartbeat(device_id: &str, apikey: &str) -> Value {
    json!({
        "action": "query",
        "deviceid": device_id,
        "apikey": apikey,
        "sequence": new_sequence(),
        "ts": 0,
    })
}

/// Device-originated state report for the cloud.
#[must_use]
pub fn device_update(device_id: &str, apikey: &str, params: Value) -> Value {
    json!({
        "userAgent": USER_AGENT_DEVICE,
        "action": "update",
        "deviceid": device_id,
        "apikey": apikey,
        "params": params,
    })
}

/// Ack for an app command received from the cloud.
#[must_use]
pub fn app_ack(device_id: &str, cloud_apikey: &str, sequence: Option<String>) -> Value {
    let mut frame = Map::new();
    frame.insert("error".to_string(), json!(0));
    frame.insert("deviceid".to_string(), json!(device_id));
    frame.insert("apikey".to_string(), json!(cloud_apikey));
    frame.insert("userAgent".to_string(), json!(USER_AGENT_DEVICE));
    if let Some(sequence) = sequence {
        frame.insert("sequence".to_string(), Value::String(sequence));
    }
    Value::Object(frame)
}

// =============================================================================
// Classification
// =============================================================================

/// Meaning of a cloud frame for the owning session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudFrame {
    /// Nonzero `error`.
    Rejected {
        /// Error code.
        code: i64,
        /// Reason text, if any.
        reason: Option<String>,
    },
    /// Registration success, carrying the cloud-issued key.
    RegistrationAccepted {
        /// Key to use for cloud-bound traffic.
        apikey: String,
    },
    /// `update` command from the vendor app.
    AppUpdate,
    /// Heartbeat reply or other successful ack.
    Ack,
    /// Not recognized.
    Other,
}

/// Classify a frame received from the cloud.
///
/// A registration success is only recognized while `registered` is false.
#[must_use]
pub fn classify_cloud(frame: &Value, registered: bool) -> CloudFrame {
    let code = error_code(frame);
    if let Some(code) = code.filter(|code| *code != 0) {
        return CloudFrame::Rejected {
            code,
            reason: frame
                .get("reason")
                .and_then(Value::as_str)
                .map(ToString::to_string),
        };
    }
    if code == Some(0) && !registered && frame.get("config").is_some() {
        if let Some(apikey) = apikey_of(frame) {
            return CloudFrame::RegistrationAccepted {
                apikey: apikey.to_string(),
            };
        }
    }
    if Action::of(frame) == Some(Action::Update) && frame.get("params").is_some() {
        return CloudFrame::AppUpdate;
    }
    if code == Some(0) {
        return CloudFrame::Ack;
    }
    CloudFrame::Other
}

// =============================================================================
// Dispatch
// =============================================================================

/// Body of a device `POST /dispatch/device`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchRequest {
    /// Device identifier.
    #[serde(default)]
    pub deviceid: Option<String>,
    /// Device credential.
    #[serde(default)]
    pub apikey: Option<String>,
    /// Hardware model.
    #[serde(default)]
    pub model: Option<String>,
    /// Firmware version.
    #[serde(default, rename = "romVersion")]
    pub rom_version: Option<String>,
    /// Requested transport.
    #[serde(default)]
    pub accept: Option<String>,
}

/// Successful dispatch reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResponse {
    /// Always 0.
    pub error: i64,
    /// Always `"ok"`.
    pub reason: String,
    /// Host the device should open its socket to.
    #[serde(rename = "IP")]
    pub ip: String,
    /// Port the device should open its socket to.
    pub port: u16,
}

impl DispatchResponse {
    /// Success reply pointing at `ip:port`.
    #[must_use]
    pub fn ok(ip: impl Into<String>, port: u16) -> Self {
        Self {
            error: 0,
            reason: "ok".to_string(),
            ip: ip.into(),
            port,
        }
    }
}

/// Rejected dispatch reply body.
#[must_use]
pub fn dispatch_error(reason: &str) -> Value {
    json!({ "error": 400, "reason": reason })
}

// =============================================================================
// Tests
// =============================================================================
