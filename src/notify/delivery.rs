//! Per-recipient card delivery and the run summary.
//!
//! A failed send is recorded against its recipient and the run moves on.

use serde::Serialize;

pub use crate::lark::im::CardSender;
use crate::notify::engine::MemberAlert;
use crate::notify::urgency::Urgency;

/// One recipient's line in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryDetail {
    pub member: String,
    pub open_id: String,
    pub overdue: usize,
    pub today: usize,
    pub upcoming: usize,
    pub total: usize,
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryDetail {
    fn for_alert(alert: &MemberAlert, outcome: Result<(), String>) -> Self {
        let (sent, error) = match outcome {
            Ok(()) => (true, None),
            Err(reason) => (false, Some(reason)),
        };
        Self {
            member: alert.member.name.clone(),
            open_id: alert.member.open_id.clone(),
            overdue: alert.count(Urgency::Overdue),
            today: alert.count(Urgency::Today),
            upcoming: alert.upcoming(),
            total: alert.total(),
            sent,
            error,
        }
    }

    /// Summary line for a card that was built but not sent.
    pub fn pending(alert: &MemberAlert) -> Self {
        Self {
            sent: false,
            ..Self::for_alert(alert, Ok(()))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifyRun {
    /// Successful sends.
    pub notified: usize,
    pub details: Vec<DeliveryDetail>,
}

/// Send each rendered card in turn. Never fails as a whole.
pub async fn deliver<'a, I>(sender: &dyn CardSender, cards: I) -> NotifyRun
where
    I: IntoIterator<Item = (&'a MemberAlert, serde_json::Value)>,
{
    let mut run = NotifyRun::default();
    for (alert, card) in cards {
        let outcome = match sender.send_card(&alert.member.open_id, &card).await {
            Ok(_) => {
                run.notified += 1;
                Ok(())
            }
            Err(e) => {
                let reason = e
                    .upstream_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string());
                tracing::warn!(
                    open_id = %alert.member.open_id,
                    member = %alert.member.name,
                    "card delivery failed: {reason}"
                );
                Err(reason)
            }
        };
        run.details.push(DeliveryDetail::for_alert(alert, outcome));
    }
    run
}
