//! IM gateway frame codec.
//!
//! The gateway speaks JSON text frames. Requests carry an `lwp` path and
//! a `headers.mid` message id; responses echo the `mid` with a numeric
//! `code`; server pushes carry an `lwp` path and a body. Sync pushes wrap
//! their payloads as base64 JSON under `body.syncPushPackage.data[].data`.
//!
//! Only what the lifecycle needs is modelled here: login, heartbeat,
//! sync ack, outbound text, push acks, and coarse classification of
//! inbound pushes into [`InboundEvent`]s.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use relay_core::event::{EventKind, InboundEvent};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::connection::OutboundRequest;

pub const LWP_REGISTER: &str = "/reg";
pub const LWP_HEARTBEAT: &str = "/!";
pub const LWP_ACK_DIFF: &str = "/r/SyncStatus/ackDiff";
pub const LWP_SEND_MESSAGE: &str = "/r/MessageSend/sendByReceiverScope";
pub const LWP_SYNC_PUSH: &str = "/s/para";
pub const LWP_SYNC: &str = "/s/sync";

/// Response code for success.
pub const CODE_OK: i64 = 200;

/// Suffix the gateway appends to user and conversation ids.
const ID_SUFFIX: &str = "@goofish";

const WEB_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36 DingTalk(2.1.5) OS(Windows/10) \
    Browser(Chrome/133.0.0.0) DingWeb/2.1.5 IMPaaS DingWeb/2.1.5";

/// A decoded frame from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to one of our requests.
    Response { mid: String, code: i64 },
    /// Server-initiated push.
    Push {
        lwp: String,
        mid: Option<String>,
        sid: Option<String>,
        body: Value,
    },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    lwp: Option<String>,
    code: Option<i64>,
    #[serde(default)]
    headers: RawHeaders,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawHeaders {
    mid: Option<String>,
    sid: Option<String>,
}

/// Parse one text frame.
pub fn parse_frame(text: &str) -> Result<Frame, ProtocolError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;

    if let Some(code) = raw.code {
        let mid = raw.headers.mid.ok_or(ProtocolError::MissingField("headers.mid"))?;
        return Ok(Frame::Response { mid, code });
    }

    match raw.lwp {
        Some(lwp) => Ok(Frame::Push {
            lwp,
            mid: raw.headers.mid,
            sid: raw.headers.sid,
            body: raw.body,
        }),
        None => Err(ProtocolError::Unrecognized),
    }
}

/// Whether a push path carries sync packages.
pub fn is_sync_push(lwp: &str) -> bool {
    lwp == LWP_SYNC_PUSH || lwp == LWP_SYNC
}

/// Decode the sync packages of a push body into events.
///
/// Entries whose `data` is not base64 JSON (the gateway encrypts some
/// payload types) are passed through as [`EventKind::Notification`] with
/// the raw string under `payload.raw`.
pub fn decode_sync_push(account_id: &str, body: &Value) -> Result<Vec<InboundEvent>, ProtocolError> {
    let entries = body
        .pointer("/syncPushPackage/data")
        .and_then(Value::as_array)
        .ok_or(ProtocolError::MissingField("syncPushPackage.data"))?;

    entries
        .iter()
        .map(|entry| -> Result<InboundEvent, ProtocolError> {
            let data = entry
                .get("data")
                .and_then(Value::as_str)
                .ok_or(ProtocolError::MissingField("syncPushPackage.data[].data"))?;
            Ok(match decode_base64_json(data) {
                Some(decoded) => classify(account_id, decoded),
                None => InboundEvent::new(account_id, EventKind::Notification, json!({ "raw": data })),
            })
        })
        .collect()
}

fn decode_base64_json(data: &str) -> Option<Value> {
    let bytes = STANDARD.decode(data).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Sort a decoded payload into message / order / notification.
fn classify(account_id: &str, payload: Value) -> InboundEvent {
    if let Some(text) = payload.pointer("/1/10/reminderContent").and_then(Value::as_str) {
        let text = text.to_string();
        let sender = payload
            .pointer("/1/10/senderUserId")
            .and_then(Value::as_str)
            .map(String::from);
        let conversation = payload
            .pointer("/1/2")
            .and_then(Value::as_str)
            .map(strip_suffix);

        let mut event = InboundEvent::new(account_id, EventKind::Message, payload).with_text(text);
        if let Some(sender) = sender {
            event = event.with_sender(sender);
        }
        if let Some(conversation) = conversation {
            event = event.with_conversation(conversation);
        }
        return event;
    }

    if let Some(reminder) = payload.pointer("/3/redReminder").and_then(Value::as_str) {
        let reminder = reminder.to_string();
        return InboundEvent::new(account_id, EventKind::Order, payload).with_text(reminder);
    }

    InboundEvent::new(account_id, EventKind::Notification, payload)
}

fn strip_suffix(id: &str) -> String {
    id.strip_suffix(ID_SUFFIX).unwrap_or(id).to_string()
}

/// Ack for a push carrying `mid`.
pub fn push_ack(mid: &str, sid: Option<&str>) -> String {
    json!({
        "code": CODE_OK,
        "headers": { "mid": mid, "sid": sid.unwrap_or_default() },
    })
    .to_string()
}

/// Builds request frames and hands out message ids.
#[derive(Debug, Default)]
pub struct FrameCodec {
    seq: u32,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message id in the web client's shape: `<seq><millis> 0`.
    pub fn next_mid(&mut self) -> String {
        self.seq = (self.seq + 1) % 1000;
        format!("{}{} 0", self.seq, now_millis())
    }

    /// `/reg` login frame carrying the access token.
    pub fn register(&mut self, token: &str, device_id: &str, app_key: &str) -> (String, String) {
        let mid = self.next_mid();
        let frame = json!({
            "lwp": LWP_REGISTER,
            "headers": {
                "cache-header": "app-key token ua wv",
                "app-key": app_key,
                "token": token,
                "ua": WEB_UA,
                "dt": "j",
                "wv": "im:3,au:3,sy:6",
                "sync": "0,0;0;0;",
                "did": device_id,
                "mid": mid,
            },
        });
        (mid, frame.to_string())
    }

    pub fn heartbeat(&mut self) -> (String, String) {
        let mid = self.next_mid();
        let frame = json!({ "lwp": LWP_HEARTBEAT, "headers": { "mid": mid } });
        (mid, frame.to_string())
    }

    /// Sync-status ack sent right after login so pushes start flowing.
    pub fn ack_diff(&mut self) -> String {
        let mid = self.next_mid();
        let now = now_millis();
        json!({
            "lwp": LWP_ACK_DIFF,
            "headers": { "mid": mid },
            "body": [{
                "pipeline": "sync",
                "tooLong2Tag": "PNM,1",
                "channel": "sync",
                "topic": "sync",
                "highPts": 0,
                "pts": now * 1000,
                "seq": 0,
                "timestamp": now,
            }],
        })
        .to_string()
    }

    /// Outbound text message from `account_id`.
    pub fn send_message(&mut self, account_id: &str, request: &OutboundRequest) -> (String, String) {
        let mid = self.next_mid();
        let content = json!({ "contentType": 1, "text": { "text": request.text } });
        let encoded = STANDARD.encode(content.to_string());
        let frame = json!({
            "lwp": LWP_SEND_MESSAGE,
            "headers": { "mid": mid },
            "body": [
                {
                    "uuid": format!("-{}{}", now_millis(), self.seq),
                    "cid": format!("{}{ID_SUFFIX}", request.conversation_id),
                    "conversationType": 1,
                    "content": {
                        "contentType": 101,
                        "custom": { "type": 1, "data": encoded },
                    },
                    "redPointPolicy": 0,
                    "extension": { "extJson": "{}" },
                    "ctx": { "appVersion": "1.0", "platform": "web" },
                    "mtags": {},
                    "msgReadStatusSetting": 1,
                },
                {
                    "actualReceivers": [
                        format!("{}{ID_SUFFIX}", request.recipient_id),
                        format!("{account_id}{ID_SUFFIX}"),
                    ],
                },
            ],
        });
        (mid, frame.to_string())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Malformed or unexpected frames. Logged and dropped by the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Json(String),

    #[error("frame is missing `{0}`")]
    MissingField(&'static str),

    #[error("frame is neither a response nor a push")]
    Unrecognized,
}
