//! Turns raw task, member and project records into per-assignee alerts.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;

use crate::config::TaskFieldNames;
use crate::lark::Record;
use crate::notify::urgency::{classify, Classification, Urgency};

/// A user reference from a person field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LarkUser {
    pub id: String,
    pub name: Option<String>,
}

/// Person fields arrive as `[{id, name}, ..]` or a bare `{id, name}`; the first user wins.
pub fn extract_user(field: &Value) -> Option<LarkUser> {
    let user = match field {
        Value::Array(items) => items.first()?,
        Value::Object(_) => field,
        _ => return None,
    };
    let id = user.get("id")?.as_str().filter(|id| !id.is_empty())?;
    Some(LarkUser {
        id: id.to_string(),
        name: user
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// First linked record id of a link field, in any of its wire shapes.
pub fn extract_linked_id(field: &Value) -> Option<String> {
    if let Some(id) = field
        .get("link_record_ids")
        .and_then(|ids| ids.get(0))
        .and_then(Value::as_str)
    {
        return Some(id.to_string());
    }
    let first = field.as_array()?.first()?;
    match first {
        Value::String(id) => Some(id.clone()),
        other => other
            .get("record_ids")
            .and_then(|ids| ids.get(0))
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Flatten a text-ish cell. Rich text segments are concatenated by their `text`.
pub fn plain_text(field: &Value) -> String {
    match field {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect(),
        Value::Object(_) => field
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Value::Null | Value::Bool(_) => String::new(),
    }
}

fn millis_to_local_date(ms: i64, tz: Tz) -> Option<NaiveDate> {
    let utc: DateTime<Utc> = DateTime::from_timestamp_millis(ms)?;
    Some(utc.with_timezone(&tz).date_naive())
}

/// Due date as a calendar date in `tz`. Accepts epoch milliseconds or a date string.
pub fn parse_due_date(field: &Value, tz: Tz) -> Option<NaiveDate> {
    match field {
        Value::Number(n) => millis_to_local_date(n.as_i64()?, tz),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(ms) = s.parse::<i64>() {
                return millis_to_local_date(ms, tz);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&tz).date_naive());
            }
            for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return tz
                        .from_local_datetime(&naive)
                        .earliest()
                        .map(|dt| dt.date_naive());
                }
            }
            ["%Y-%m-%d", "%Y/%m/%d"]
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        }
        _ => None,
    }
}

/// Current calendar date in `tz`.
pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub in_progress: usize,
    pub pending: usize,
    pub completed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertTask {
    pub record_id: String,
    pub name: String,
    pub project_name: Option<String>,
    pub priority: String,
    pub due_date: NaiveDate,
    pub classification: Classification,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskGroup {
    pub urgency: Urgency,
    pub tasks: Vec<AlertTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub open_id: String,
    pub name: String,
}

/// Everything one assignee is told in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberAlert {
    pub member: Member,
    /// Non-empty groups, most urgent first.
    pub groups: Vec<TaskGroup>,
    pub stats: TaskStats,
}

impl MemberAlert {
    pub fn total(&self) -> usize {
        self.groups.iter().map(|g| g.tasks.len()).sum()
    }

    pub fn count(&self, urgency: Urgency) -> usize {
        self.groups
            .iter()
            .filter(|g| g.urgency == urgency)
            .map(|g| g.tasks.len())
            .sum()
    }

    pub fn upcoming(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.urgency.is_upcoming())
            .map(|g| g.tasks.len())
            .sum()
    }

    /// Most urgent class present.
    pub fn severity(&self) -> Urgency {
        self.groups
            .first()
            .map(|g| g.urgency)
            .unwrap_or(Urgency::Notice)
    }

    /// Group urgencies in display order.
    pub fn group_urgencies(&self) -> Vec<Urgency> {
        self.groups.iter().map(|g| g.urgency).collect()
    }
}

fn project_names(projects: &[Record], fields: &TaskFieldNames) -> HashMap<String, String> {
    projects
        .iter()
        .map(|r| {
            let name = r.field(&fields.project_name).map(plain_text).unwrap_or_default();
            (r.record_id.clone(), name)
        })
        .collect()
}

fn member_directory(members: &[Record], fields: &TaskFieldNames) -> HashMap<String, Member> {
    members
        .iter()
        .filter_map(|r| {
            let user = extract_user(r.field(&fields.member_user)?)?;
            let name = r
                .field(&fields.member_name)
                .map(plain_text)
                .filter(|n| !n.is_empty())
                .or(user.name)
                .unwrap_or_else(|| user.id.clone());
            Some((
                user.id.clone(),
                Member {
                    open_id: user.id,
                    name,
                },
            ))
        })
        .collect()
}

fn priority_label(record: &Record, fields: &TaskFieldNames) -> String {
    let raw = record.field(&fields.priority).map(plain_text).unwrap_or_default();
    let label = raw.split('-').next().unwrap_or_default().trim();
    if label.is_empty() {
        fields.default_priority.clone()
    } else {
        label.to_string()
    }
}

#[derive(Default)]
struct Assignee {
    stats: TaskStats,
    alerts: Vec<AlertTask>,
}

/// Build one alert per registered assignee that has at least one alert-eligible task.
///
/// Assignees appear in the order their first task appears in `tasks`.
pub fn build_member_alerts(
    tasks: &[Record],
    members: &[Record],
    projects: &[Record],
    today: NaiveDate,
    tz: Tz,
    fields: &TaskFieldNames,
) -> Vec<MemberAlert> {
    let projects = project_names(projects, fields);
    let directory = member_directory(members, fields);

    let mut order: Vec<String> = Vec::new();
    let mut by_assignee: HashMap<String, Assignee> = HashMap::new();

    for record in tasks {
        let Some(user) = record.field(&fields.assignee).and_then(extract_user) else {
            continue;
        };
        let entry = by_assignee.entry(user.id.clone()).or_insert_with(|| {
            order.push(user.id.clone());
            Assignee::default()
        });

        let status = record
            .field(&fields.status)
            .map(plain_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| fields.status_pending.clone());
        if status == fields.status_completed {
            entry.stats.completed += 1;
            continue;
        }
        if status == fields.status_in_progress {
            entry.stats.in_progress += 1;
        } else {
            entry.stats.pending += 1;
        }

        let Some(due_date) = record
            .field(&fields.due_date)
            .and_then(|v| parse_due_date(v, tz))
        else {
            continue;
        };
        let days_remaining = (due_date - today).num_days();
        let Some(classification) = classify(days_remaining) else {
            continue;
        };

        let project_name = record
            .field(&fields.project)
            .and_then(extract_linked_id)
            .and_then(|id| projects.get(&id).cloned())
            .filter(|n| !n.is_empty());

        entry.alerts.push(AlertTask {
            record_id: record.record_id.clone(),
            name: record.field(&fields.task_name).map(plain_text).unwrap_or_default(),
            project_name,
            priority: priority_label(record, fields),
            due_date,
            classification,
        });
    }

    let mut alerts = Vec::new();
    for open_id in order {
        let Some(mut assignee) = by_assignee.remove(&open_id) else {
            continue;
        };
        if assignee.alerts.is_empty() {
            continue;
        }
        let Some(member) = directory.get(&open_id).cloned() else {
            tracing::debug!(open_id = %open_id, "assignee not in members table, skipping");
            continue;
        };

        assignee.alerts.sort_by(|a, b| {
            a.classification
                .urgency
                .cmp(&b.classification.urgency)
                .then_with(|| a.priority.cmp(&b.priority))
        });

        let mut groups: Vec<TaskGroup> = Vec::new();
        for task in assignee.alerts {
            let urgency = task.classification.urgency;
            if let Some(group) = groups.last_mut().filter(|g| g.urgency == urgency) {
                group.tasks.push(task);
            } else {
                groups.push(TaskGroup {
                    urgency,
                    tasks: vec![task],
                });
            }
        }

        alerts.push(MemberAlert {
            member,
            groups,
            stats: assignee.stats,
        });
    }
    alerts
}
