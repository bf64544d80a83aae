/// 后端记录 ID 的序列化/反序列化辅助模块

use serde::{Deserialize, Deserializer, Serializer};

/// Record ids arrive either as JSON strings (uuid columns) or numbers
/// (identity columns); both are carried as `String` locally.
pub mod record_id {
    use super::*;

    pub fn serialize<S>(id: &str, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(id)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IdValue {
            String(String),
            Number(serde_json::Number),
        }

        match IdValue::deserialize(deserializer)? {
            IdValue::String(s) => Ok(s),
            IdValue::Number(n) => Ok(n.to_string()),
        }
    }
}
