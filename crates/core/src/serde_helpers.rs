use serde_json::{Map, Value};

use crate::FleetResult;

/// 任务参数、状态数据等开放键值结构
pub type JsonMap = Map<String, Value>;

/// 写入数据库前序列化为 JSON 文本
pub fn json_map_to_text(map: &JsonMap) -> FleetResult<String> {
    Ok(serde_json::to_string(map)?)
}

/// 空字符串或 NULL 视为空映射
pub fn json_map_from_text(text: Option<&str>) -> FleetResult<JsonMap> {
    match text.map(str::trim) {
        None | Some("") | Some("null") => Ok(JsonMap::new()),
        Some(text) => Ok(serde_json::from_str(text)?),
    }
}

/// `Duration` 以毫秒整数形式序列化
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// 数据库中的毫秒数与 `Duration` 互转，负数视为 0
pub fn duration_from_millis(millis: i64) -> std::time::Duration {
    std::time::Duration::from_millis(millis.max(0) as u64)
}

pub fn duration_to_millis(duration: std::time::Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}
