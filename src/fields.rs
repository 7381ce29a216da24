//! Declarative mapping from caller-facing keys to Bitable field values.
//!
//! Each rule names the external key, the Bitable field it writes and how the
//! value is shaped for that field type. Absent, null and empty-string inputs
//! are skipped.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FieldMappingError {
    #[error("field {key}: cannot read {value} as a date")]
    InvalidDate { key: String, value: String },

    #[error("field {key}: expected {expected}, got {value}")]
    WrongType {
        key: String,
        expected: &'static str,
        value: String,
    },
}

/// Shape applied to a value before it is written to Bitable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Written unchanged.
    Identity,
    /// Date or datetime string to epoch milliseconds. Numbers pass through.
    DateToMillis,
    /// Record id to a one-element link list. Arrays pass through.
    LinkList,
    /// Open id to `[{"id": ..}]`.
    Person,
    /// URL string to `{ "link": url, "text": url }`.
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub key: String,
    pub field: String,
    pub transform: Transform,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    rules: Vec<FieldRule>,
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn parse_date_millis(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn wrong_type(key: &str, expected: &'static str, value: &Value) -> FieldMappingError {
    FieldMappingError::WrongType {
        key: key.to_string(),
        expected,
        value: value.to_string(),
    }
}

impl Transform {
    pub fn apply(self, key: &str, value: &Value) -> Result<Value, FieldMappingError> {
        match self {
            Self::Identity => Ok(value.clone()),
            Self::DateToMillis => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(s) => parse_date_millis(s).map(Value::from).ok_or_else(|| {
                    FieldMappingError::InvalidDate {
                        key: key.to_string(),
                        value: s.clone(),
                    }
                }),
                other => Err(wrong_type(key, "a date string", other)),
            },
            Self::LinkList => match value {
                Value::Array(_) => Ok(value.clone()),
                Value::String(_) => Ok(Value::Array(vec![value.clone()])),
                other => Err(wrong_type(key, "a record id", other)),
            },
            Self::Person => match value {
                Value::String(id) => Ok(serde_json::json!([{ "id": id }])),
                Value::Array(_) => Ok(value.clone()),
                other => Err(wrong_type(key, "an open id", other)),
            },
            Self::Url => match value {
                Value::String(url) => Ok(serde_json::json!({ "link": url, "text": url })),
                Value::Object(_) => Ok(value.clone()),
                other => Err(wrong_type(key, "a URL", other)),
            },
        }
    }
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, key: &str, field: &str, transform: Transform) -> Self {
        self.rules.push(FieldRule {
            key: key.to_string(),
            field: field.to_string(),
            transform,
        });
        self
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Fields written when a task is created.
    pub fn task_create() -> Self {
        Self::new()
            .rule("name", "任务名称", Transform::Identity)
            .rule("priority", "优先级", Transform::Identity)
            .rule("status", "状态", Transform::Identity)
            .rule("projectId", "所属项目", Transform::LinkList)
            .rule("nodeId", "所属节点", Transform::LinkList)
            .rule("assignee", "负责人", Transform::Person)
            .rule("startDate", "开始日期", Transform::DateToMillis)
            .rule("dueDate", "截止日期", Transform::DateToMillis)
            .rule("description", "任务描述", Transform::Identity)
    }

    /// Fields a task update may touch.
    pub fn task_update() -> Self {
        Self::new()
            .rule("status", "状态", Transform::Identity)
            .rule("startDate", "开始日期", Transform::DateToMillis)
            .rule("dueDate", "截止日期", Transform::DateToMillis)
            .rule("completeDate", "完成日期", Transform::DateToMillis)
            .rule("outputFile", "输出文件", Transform::Identity)
            .rule("description", "任务描述", Transform::Identity)
            .rule("outputUrl", "输出链接", Transform::Url)
            .rule("outputText", "输出文字", Transform::Identity)
    }

    /// Map caller input to Bitable fields. Keys without a rule are ignored.
    pub fn apply(&self, input: &Map<String, Value>) -> Result<Map<String, Value>, FieldMappingError> {
        let mut out = Map::new();
        for rule in &self.rules {
            let Some(value) = input.get(&rule.key).filter(|v| !is_blank(v)) else {
                continue;
            };
            out.insert(rule.field.clone(), rule.transform.apply(&rule.key, value)?);
        }
        Ok(out)
    }
}
