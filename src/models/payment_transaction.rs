use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment providers feeding the transaction ledger.
///
/// `Internal` covers synthetic transactions created by the platform itself
/// (manual and promotional entitlement grants).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentProvider {
    #[sea_orm(string_value = "paylane")]
    Paylane,
    #[sea_orm(string_value = "fastbill")]
    Fastbill,
    #[sea_orm(string_value = "internal")]
    Internal,
}

/// Lifecycle state of a payment transaction.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionState {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "cancelled_after_complete")]
    CancelledAfterComplete,
}

impl TransactionState {
    /// The transition table. Everything not listed here is illegal and must
    /// be rejected at the ledger boundary.
    pub fn can_transition_to(self, target: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, target),
            (Created, Completed) | (Created, Cancelled) | (Completed, CancelledAfterComplete)
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        use TransactionState::*;
        matches!(self, Cancelled | CancelledAfterComplete)
    }

    pub fn is_cancelled(self) -> bool {
        use TransactionState::*;
        matches!(self, Cancelled | CancelledAfterComplete)
    }

    /// Numeric state code reported on the RPC gateway.
    pub fn provider_code(self) -> i32 {
        match self {
            TransactionState::Created => 1,
            TransactionState::Completed => 2,
            TransactionState::Cancelled => -1,
            TransactionState::CancelledAfterComplete => -2,
        }
    }
}

/// Cancellation reason codes carried on the RPC gateway and stamped by the
/// timeout sweep.
pub mod reason {
    /// Transaction stayed in `created` past the pending timeout window.
    pub const TIMEOUT: i32 = 4;
    /// Funds returned to the payer after completion.
    pub const REFUND: i32 = 5;
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub id: Uuid,
    pub provider: PaymentProvider,
    /// Provider-assigned transaction id; unique within a provider.
    #[sea_orm(column_type = "Text")]
    pub provider_tx_id: String,
    /// Our order/invoice identifier as the provider knows it.
    #[sea_orm(column_type = "Text")]
    pub merchant_order_id: String,
    pub user_id: Uuid,
    /// Amount in minor currency units. Immutable after creation.
    pub amount: i64,
    pub state: TransactionState,
    pub reason_code: Option<i32>,
    /// Plan/duration overrides carried by synthetic grant transactions.
    pub plan: Option<super::user_entitlement::SubscriptionPlan>,
    pub duration_days: Option<i32>,
    /// Creation timestamp from the provider's clock (milliseconds), when given.
    pub provider_create_time: Option<i64>,
    pub retry_count: i32,
    #[sea_orm(column_type = "Json", nullable)]
    pub raw_payload: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub performed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Provider create time in milliseconds, falling back to our own clock.
    pub fn create_time_ms(&self) -> i64 {
        self.provider_create_time
            .unwrap_or_else(|| self.created_at.timestamp_millis())
    }

    pub fn perform_time_ms(&self) -> i64 {
        self.performed_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }

    pub fn cancel_time_ms(&self) -> i64 {
        self.cancelled_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_allows_only_specified_edges() {
        use TransactionState::*;
        let states = [Created, Completed, Cancelled, CancelledAfterComplete];

        for from in states {
            for to in states {
                let legal = matches!(
                    (from, to),
                    (Created, Completed) | (Created, Cancelled) | (Completed, CancelledAfterComplete)
                );
                assert_eq!(
                    from.can_transition_to(to),
                    legal,
                    "{from:?} -> {to:?} legality mismatch"
                );
            }
        }
    }

    #[test]
    fn completed_cannot_revert_to_created() {
        assert!(!TransactionState::Completed.can_transition_to(TransactionState::Created));
    }

    #[test]
    fn cancelled_cannot_complete() {
        assert!(!TransactionState::Cancelled.can_transition_to(TransactionState::Completed));
        assert!(
            !TransactionState::CancelledAfterComplete.can_transition_to(TransactionState::Completed)
        );
    }

    #[test]
    fn provider_codes_are_stable() {
        assert_eq!(TransactionState::Created.provider_code(), 1);
        assert_eq!(TransactionState::Completed.provider_code(), 2);
        assert_eq!(TransactionState::Cancelled.provider_code(), -1);
        assert_eq!(TransactionState::CancelledAfterComplete.provider_code(), -2);
    }
}
