//! Interactive card rendering for a [`MemberAlert`].

use serde_json::{json, Value};

use crate::notify::engine::{AlertTask, MemberAlert, TaskGroup};
use crate::notify::urgency::Urgency;

fn md(content: impl Into<String>) -> Value {
    json!({ "tag": "lark_md", "content": content.into() })
}

fn md_div(content: impl Into<String>) -> Value {
    json!({ "tag": "div", "text": md(content) })
}

fn short_field(content: impl Into<String>) -> Value {
    json!({ "is_short": true, "text": md(content) })
}

fn task_row(task: &AlertTask) -> Value {
    json!({
        "tag": "div",
        "fields": [
            short_field(format!("{} **{}**", task.classification.urgency.marker(), task.name)),
            short_field(task.project_name.as_deref().unwrap_or("-")),
            short_field(task.priority.as_str()),
            short_field(task.classification.label.as_str()),
        ]
    })
}

fn push_group(elements: &mut Vec<Value>, group: &TaskGroup, display_limit: usize) {
    elements.push(json!({ "tag": "hr" }));
    elements.push(md_div(format!(
        "{} **{}** ({})",
        group.urgency.icon(),
        group.urgency.title(),
        group.tasks.len()
    )));
    elements.extend(group.tasks.iter().take(display_limit).map(task_row));
    if group.tasks.len() > display_limit {
        elements.push(md_div(format!(
            "...and {} more",
            group.tasks.len() - display_limit
        )));
    }
}

/// Header title, chosen by the most urgent group.
pub fn header_title(alert: &MemberAlert) -> String {
    let total = alert.total();
    match alert.severity() {
        Urgency::Overdue | Urgency::Today => format!("⚠️ Overdue / due today ({total})"),
        _ => format!("📋 Upcoming deadlines ({total})"),
    }
}

/// Render the card sent to one assignee. Each group shows at most `display_limit` tasks.
pub fn render_card(alert: &MemberAlert, display_limit: usize, dashboard_url: Option<&str>) -> Value {
    let mut elements = vec![md_div(format!(
        "**{}**, you have **{}** tasks that need attention:",
        alert.member.name,
        alert.total()
    ))];

    for group in &alert.groups {
        push_group(&mut elements, group, display_limit);
    }

    elements.push(json!({ "tag": "hr" }));
    elements.push(md_div(format!(
        "📊 Overview: in progress {} | pending {} | completed {}",
        alert.stats.in_progress, alert.stats.pending, alert.stats.completed
    )));

    if let Some(url) = dashboard_url.filter(|u| !u.is_empty()) {
        elements.push(json!({
            "tag": "action",
            "actions": [{
                "tag": "button",
                "text": { "tag": "plain_text", "content": "Open dashboard" },
                "url": url,
                "type": "primary"
            }]
        }));
    }

    json!({
        "config": { "wide_screen_mode": true },
        "header": {
            "title": { "tag": "plain_text", "content": header_title(alert) },
            "template": alert.severity().header_template()
        },
        "elements": elements
    })
}
