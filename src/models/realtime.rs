use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// One notified mutation on a record collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
    #[serde(default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: &str) -> Self {
        Self {
            kind,
            table: table.to_string(),
            record: None,
            old_record: None,
            commit_timestamp: None,
        }
    }
}

/// Envelope of every frame on the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";
pub const EVENT_ACCESS_TOKEN: &str = "access_token";

impl ChannelMessage {
    /// 生成频道名称
    pub fn topic_for(table: &str) -> String {
        format!("realtime:public:{}", table)
    }

    pub fn join(table: &str, kinds: &[ChangeKind], access_token: Option<&str>, msg_ref: u64) -> Self {
        let changes: Vec<Value> = kinds
            .iter()
            .map(|kind| {
                json!({
                    "event": kind.as_str(),
                    "schema": "public",
                    "table": table,
                })
            })
            .collect();

        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = json!(token);
        }

        Self {
            topic: Self::topic_for(table),
            event: EVENT_JOIN.to_string(),
            payload,
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    pub fn leave(table: &str, msg_ref: u64) -> Self {
        Self {
            topic: Self::topic_for(table),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    /// Hands a refreshed JWT to an already joined channel.
    pub fn access_token(table: &str, access_token: &str, msg_ref: u64) -> Self {
        Self {
            topic: Self::topic_for(table),
            event: EVENT_ACCESS_TOKEN.to_string(),
            payload: json!({ "access_token": access_token }),
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    pub fn heartbeat(msg_ref: u64) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    /// Extracts the change carried by a `postgres_changes` frame.
    pub fn change_event(&self) -> Option<ChangeEvent> {
        if self.event != EVENT_CHANGES {
            return None;
        }
        let data = self.payload.get("data")?;
        serde_json::from_value(data.clone()).ok()
    }

    /// True for the server's `ok` reply to the join sent with `join_ref`.
    pub fn is_join_ack(&self, topic: &str, join_ref: u64) -> bool {
        self.event == EVENT_REPLY
            && self.topic == topic
            && self.msg_ref.as_deref() == Some(join_ref.to_string().as_str())
            && self.payload.get("status").and_then(|s| s.as_str()) == Some("ok")
    }

    /// True when the server errored or closed the channel on `topic`.
    pub fn closes_channel(&self, topic: &str) -> bool {
        self.topic == topic && (self.event == EVENT_ERROR || self.event == EVENT_CLOSE)
    }

    /// True for a join reply whose status is not `ok`.
    pub fn is_join_rejection(&self) -> bool {
        self.event == EVENT_REPLY
            && self.payload.get("status").and_then(|s| s.as_str()).map_or(false, |s| s != "ok")
    }
}
