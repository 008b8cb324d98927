use crate::models::{PaymentProvider, SubscriptionPlan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Events emitted by the ledger and the entitlement reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    TransactionCreated {
        transaction_id: Uuid,
        provider: PaymentProvider,
        user_id: Uuid,
        amount: i64,
    },
    TransactionCompleted {
        transaction_id: Uuid,
        provider: PaymentProvider,
        user_id: Uuid,
        amount: i64,
        performed_at: DateTime<Utc>,
    },
    TransactionCancelled {
        transaction_id: Uuid,
        provider: PaymentProvider,
        user_id: Uuid,
        reason_code: Option<i32>,
    },
    EntitlementActivated {
        user_id: Uuid,
        plan: SubscriptionPlan,
        expiry_date: DateTime<Utc>,
    },
    EntitlementExpired {
        user_id: Uuid,
    },
    SweepCompleted {
        expired: u64,
        repaired: u64,
        activated: u64,
        errors: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously. Delivery is best-effort; a full or
    /// closed channel is reported to the caller, not retried here.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Background consumer draining the event channel. Events currently feed the
/// log stream; downstream notification fan-out hangs off this loop.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::TransactionCompleted {
                transaction_id,
                user_id,
                amount,
                ..
            } => {
                info!(%transaction_id, %user_id, amount, "transaction completed");
            }
            Event::EntitlementActivated {
                user_id,
                plan,
                expiry_date,
            } => {
                info!(%user_id, %plan, %expiry_date, "entitlement activated");
            }
            Event::EntitlementExpired { user_id } => {
                info!(%user_id, "entitlement expired");
            }
            other => debug!(?other, "event processed"),
        }
    }
    info!("Event processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);

        sender
            .send(Event::EntitlementExpired {
                user_id: Uuid::new_v4(),
            })
            .await
            .expect("send should succeed");

        assert!(matches!(
            rx.recv().await,
            Some(Event::EntitlementExpired { .. })
        ));
    }

    #[tokio::test]
    async fn send_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);

        let result = sender
            .send(Event::EntitlementExpired {
                user_id: Uuid::new_v4(),
            })
            .await;
        assert!(result.is_err());
    }
}
