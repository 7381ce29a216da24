//! Deadline notifications: fetch tasks, classify, render and deliver cards.

pub mod card;
pub mod delivery;
pub mod engine;
pub mod urgency;

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::config::NotifyConfig;
use crate::error::Result;
use crate::lark::BitableClient;

pub use card::render_card;
pub use delivery::{deliver, CardSender, DeliveryDetail, NotifyRun};
pub use engine::{build_member_alerts, today_in, MemberAlert, TaskStats};
pub use urgency::{classify, Classification, Urgency};

#[derive(Debug, Clone, Serialize)]
pub struct NotifyReport {
    pub timestamp: DateTime<Utc>,
    pub dry_run: bool,
    #[serde(flatten)]
    pub run: NotifyRun,
    /// Rendered cards, only kept on dry runs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cards: Vec<serde_json::Value>,
}

/// One notification run over the configured task, member and project tables.
pub struct NotifyJob {
    bitable: BitableClient,
    sender: Arc<dyn CardSender>,
    config: NotifyConfig,
    tz: Tz,
}

impl NotifyJob {
    pub fn new(
        bitable: BitableClient,
        sender: Arc<dyn CardSender>,
        config: NotifyConfig,
        tz: Tz,
    ) -> Self {
        Self {
            bitable,
            sender,
            config,
            tz,
        }
    }

    /// Fetch all three tables and build alerts. Any fetch failure aborts.
    pub async fn build(&self, today: NaiveDate) -> Result<Vec<MemberAlert>> {
        let (tasks, members, projects) = tokio::try_join!(
            self.bitable.fetch_all(&self.config.tasks_table),
            self.bitable.fetch_all(&self.config.members_table),
            self.bitable.fetch_all(&self.config.projects_table),
        )?;
        tracing::info!(
            tasks = tasks.len(),
            members = members.len(),
            projects = projects.len(),
            "fetched notification sources"
        );
        Ok(build_member_alerts(
            &tasks,
            &members,
            &projects,
            today,
            self.tz,
            &self.config.fields,
        ))
    }

    pub async fn run(&self, today: NaiveDate, dry_run: bool) -> Result<NotifyReport> {
        let alerts = self.build(today).await?;
        let dashboard = self.config.dashboard_url.as_deref();
        let cards: Vec<serde_json::Value> = alerts
            .iter()
            .map(|a| render_card(a, self.config.display_limit, dashboard))
            .collect();

        let (run, cards) = if dry_run {
            let details = alerts.iter().map(DeliveryDetail::pending).collect();
            (
                NotifyRun {
                    notified: 0,
                    details,
                },
                cards,
            )
        } else {
            let run = deliver(self.sender.as_ref(), alerts.iter().zip(cards)).await;
            (run, Vec::new())
        };

        tracing::info!(
            recipients = run.details.len(),
            notified = run.notified,
            dry_run,
            "notification run finished"
        );
        Ok(NotifyReport {
            timestamp: Utc::now(),
            dry_run,
            run,
            cards,
        })
    }
}
