//! Urgency classes for open tasks, by whole calendar days until due.

use serde::Serialize;

/// Declaration order is the display order: most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Overdue,
    Today,
    Urgent,
    Warning,
    Notice,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overdue => "overdue",
            Self::Today => "today",
            Self::Urgent => "urgent",
            Self::Warning => "warning",
            Self::Notice => "notice",
        }
    }

    /// Group heading on the card.
    pub fn title(self) -> &'static str {
        match self {
            Self::Overdue => "Overdue",
            Self::Today => "Due today",
            Self::Urgent => "Due tomorrow",
            Self::Warning => "Due within 3 days",
            Self::Notice => "Due within 5 days",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Overdue => "🔴",
            Self::Today => "⏰",
            Self::Urgent => "🟠",
            Self::Warning => "🟡",
            Self::Notice => "🔵",
        }
    }

    /// Per-task marker shown next to the task name.
    pub fn marker(self) -> &'static str {
        match self {
            Self::Overdue | Self::Today => "🔴",
            Self::Urgent => "🟠",
            Self::Warning => "🟡",
            Self::Notice => "🔵",
        }
    }

    /// Card header template colour when this is the most urgent group.
    pub fn header_template(self) -> &'static str {
        match self {
            Self::Overdue | Self::Today => "red",
            Self::Urgent => "orange",
            Self::Warning => "yellow",
            Self::Notice => "blue",
        }
    }

    pub fn is_upcoming(self) -> bool {
        matches!(self, Self::Urgent | Self::Warning | Self::Notice)
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub urgency: Urgency,
    pub label: String,
    pub days_remaining: i64,
}

/// Classify by `due − today` in days. Anything beyond five days is not alerted.
pub fn classify(days_remaining: i64) -> Option<Classification> {
    let (urgency, label) = match days_remaining {
        d if d < 0 => (Urgency::Overdue, format!("overdue by {} days", d.unsigned_abs())),
        0 => (Urgency::Today, "due today".to_string()),
        1 => (Urgency::Urgent, "due tomorrow".to_string()),
        2..=3 => (Urgency::Warning, format!("due in {days_remaining} days")),
        4..=5 => (Urgency::Notice, format!("due in {days_remaining} days")),
        _ => return None,
    };
    Some(Classification {
        urgency,
        label,
        days_remaining,
    })
}
