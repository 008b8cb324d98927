use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        payment_transaction,
        user_entitlement::{self, EntitlementSource, SubscriptionPlan},
        PaymentProvider, TransactionState,
    },
    services::ledger::{NewTransaction, TransactionLedger, TransitionStamp},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// A completed payment as the stacking fold sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPayment {
    pub paid_at: DateTime<Utc>,
    pub amount: i64,
    pub plan: SubscriptionPlan,
    pub duration_days: i32,
    pub source: EntitlementSource,
}

/// Result of folding a user's completed payments into one timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryProjection {
    pub plan: SubscriptionPlan,
    pub expiry: DateTime<Utc>,
    pub first_paid_at: DateTime<Utc>,
    pub last_amount: i64,
    pub last_duration_days: i32,
    pub source: EntitlementSource,
}

/// Fold an ascending-by-paid-time sequence of completed payments into a
/// single expiry timeline.
///
/// The cursor starts at the first payment's paid time. Each payment opens its
/// window at `max(paid_at, cursor)`: a payment made while still entitled
/// stacks on top of the running expiry; a payment made after a lapse restarts
/// the timeline at its own paid time, so no credit is back-dated across the
/// gap.
pub fn project_expiry(payments: &[CompletedPayment]) -> Option<ExpiryProjection> {
    let first = payments.first()?;
    let mut expiry = first.paid_at;

    for payment in payments {
        let start = if payment.paid_at > expiry {
            payment.paid_at
        } else {
            expiry
        };
        expiry = start + Duration::days(i64::from(payment.duration_days));
    }

    let last = payments.last()?;
    Some(ExpiryProjection {
        plan: last.plan,
        expiry,
        first_paid_at: first.paid_at,
        last_amount: last.amount,
        last_duration_days: last.duration_days,
        source: last.source,
    })
}

/// What a reconciliation pass did for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Nothing to change.
    Unchanged,
    /// A non-free entitlement had passed its expiry and was reverted to free.
    Expired,
    /// A non-free entitlement was missing its expiry and was reverted to free.
    Repaired,
    /// A valid stacked window was found and the entitlement activated.
    Activated,
}

/// Entitlement view handed to the rest of the platform (access control).
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EntitlementView {
    pub user_id: Uuid,
    #[schema(value_type = String, example = "premium")]
    pub plan: SubscriptionPlan,
    pub expiry_date: Option<DateTime<Utc>>,
    pub active: bool,
}

/// The single authoritative reconciliation service. Every write to
/// `user_entitlements` flows through here; the lazy request path, both
/// gateway adapters, and the batch sweep all call the same code.
pub struct EntitlementService {
    db: Arc<DatabaseConnection>,
    ledger: Arc<TransactionLedger>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
    /// Per-user critical sections; cross-user reconciliation stays parallel.
    user_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl EntitlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        ledger: Arc<TransactionLedger>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            ledger,
            config,
            event_sender,
            user_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: Uuid) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolve the entitlement window a ledger record purchases.
    ///
    /// Synthetic grants carry their own plan/duration; paid transactions go
    /// through the price table. An amount outside the table is a hard error,
    /// never a silent default plan.
    fn payment_from_transaction(
        &self,
        tx: &payment_transaction::Model,
    ) -> Result<CompletedPayment, ServiceError> {
        let paid_at = tx.performed_at.ok_or_else(|| {
            ServiceError::InternalError(format!(
                "completed transaction {} is missing performed_at",
                tx.id
            ))
        })?;

        let source = if tx.provider == PaymentProvider::Internal {
            EntitlementSource::Grant
        } else {
            EntitlementSource::Payment
        };

        if let (Some(plan), Some(days)) = (tx.plan, tx.duration_days) {
            return Ok(CompletedPayment {
                paid_at,
                amount: tx.amount,
                plan,
                duration_days: days,
                source,
            });
        }

        let point = self.config.plan_for_amount(tx.amount).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "transaction {} amount {} matches no configured price point",
                tx.id, tx.amount
            ))
        })?;

        Ok(CompletedPayment {
            paid_at,
            amount: tx.amount,
            plan: point.plan,
            duration_days: point.duration_days,
            source,
        })
    }

    /// Run one reconciliation pass for a user. Idempotent; repeated runs on
    /// an unchanged ledger converge to the same `(plan, expiry)`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn reconcile_user(&self, user_id: Uuid) -> Result<ReconcileOutcome, ServiceError> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let stored = user_entitlement::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut outcome = ReconcileOutcome::Unchanged;

        // Lazy expiration / inconsistency repair: unconditional and idempotent.
        if let Some(current) = stored.as_ref() {
            if !current.plan.is_free() {
                match current.expiry_date {
                    Some(expiry) if expiry > now => {
                        return Ok(ReconcileOutcome::Unchanged);
                    }
                    Some(_) => {
                        outcome = ReconcileOutcome::Expired;
                    }
                    None => {
                        warn!("non-free entitlement with missing expiry, reverting to free");
                        outcome = ReconcileOutcome::Repaired;
                    }
                }
            }
        }

        // The entitlement is free or lapsed; attempt activation from the ledger.
        let transactions = self.ledger.completed_for_user(user_id).await?;
        let payments = transactions
            .iter()
            .map(|tx| self.payment_from_transaction(tx))
            .collect::<Result<Vec<_>, _>>()?;

        let projection = project_expiry(&payments).filter(|p| p.expiry > now);

        let desired = match &projection {
            Some(p) => user_entitlement::Model {
                user_id,
                plan: p.plan,
                expiry_date: Some(p.expiry),
                activated_at: Some(p.first_paid_at),
                source: Some(p.source),
                duration_days: Some(p.last_duration_days),
                last_payment_amount: Some(p.last_amount),
                payment_status: Some("completed".to_string()),
                updated_at: now,
            },
            None => user_entitlement::Model {
                user_id,
                plan: SubscriptionPlan::Free,
                expiry_date: None,
                activated_at: stored.as_ref().and_then(|e| e.activated_at),
                source: stored.as_ref().and_then(|e| e.source),
                duration_days: None,
                last_payment_amount: stored.as_ref().and_then(|e| e.last_payment_amount),
                payment_status: stored.as_ref().and_then(|e| e.payment_status.clone()),
                updated_at: now,
            },
        };

        if projection.is_some() {
            outcome = ReconcileOutcome::Activated;
        }

        // Persist only when a field actually changed.
        let dirty = match &stored {
            Some(current) => {
                current.plan != desired.plan
                    || current.expiry_date != desired.expiry_date
                    || current.activated_at != desired.activated_at
                    || current.source != desired.source
                    || current.duration_days != desired.duration_days
                    || current.last_payment_amount != desired.last_payment_amount
                    || current.payment_status != desired.payment_status
            }
            None => !desired.plan.is_free() || desired.expiry_date.is_some(),
        };

        if !dirty {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let active = user_entitlement::ActiveModel {
            user_id: Set(desired.user_id),
            plan: Set(desired.plan),
            expiry_date: Set(desired.expiry_date),
            activated_at: Set(desired.activated_at),
            source: Set(desired.source),
            duration_days: Set(desired.duration_days),
            last_payment_amount: Set(desired.last_payment_amount),
            payment_status: Set(desired.payment_status.clone()),
            updated_at: Set(now),
        };

        if stored.is_some() {
            active.update(&*self.db).await.map_err(ServiceError::db_error)?;
        } else {
            active.insert(&*self.db).await.map_err(ServiceError::db_error)?;
        }

        match outcome {
            ReconcileOutcome::Activated => {
                info!(plan = %desired.plan, expiry = ?desired.expiry_date, "entitlement activated");
                if let Some(expiry) = desired.expiry_date {
                    let _ = self
                        .event_sender
                        .send(Event::EntitlementActivated {
                            user_id,
                            plan: desired.plan,
                            expiry_date: expiry,
                        })
                        .await;
                }
            }
            ReconcileOutcome::Expired | ReconcileOutcome::Repaired => {
                info!("entitlement reverted to free");
                let _ = self
                    .event_sender
                    .send(Event::EntitlementExpired { user_id })
                    .await;
            }
            ReconcileOutcome::Unchanged => {}
        }

        Ok(outcome)
    }

    /// Entitlement read for the rest of the platform. Reconciles lazily
    /// first, so access control always reflects the ledger.
    pub async fn get_entitlement(&self, user_id: Uuid) -> Result<EntitlementView, ServiceError> {
        self.reconcile_user(user_id).await?;

        let now = Utc::now();
        let stored = user_entitlement::Entity::find_by_id(user_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(match stored {
            Some(e) => EntitlementView {
                user_id,
                plan: e.plan,
                expiry_date: e.expiry_date,
                active: e.is_active_at(now),
            },
            None => EntitlementView {
                user_id,
                plan: SubscriptionPlan::Free,
                expiry_date: None,
                active: false,
            },
        })
    }

    /// Manual/promotional grant: a synthetic zero-amount transaction in the
    /// ledger, then a normal reconciliation pass. The entitlement row itself
    /// is never hand-edited.
    #[instrument(skip(self), fields(user_id = %user_id, plan = %plan, duration_days))]
    pub async fn grant_entitlement(
        &self,
        user_id: Uuid,
        plan: SubscriptionPlan,
        duration_days: i32,
    ) -> Result<EntitlementView, ServiceError> {
        if plan.is_free() {
            return Err(ServiceError::ValidationError(
                "cannot grant the free plan".to_string(),
            ));
        }
        if duration_days <= 0 {
            return Err(ServiceError::ValidationError(
                "grant duration must be positive".to_string(),
            ));
        }

        let grant_id = format!("grant-{}", Uuid::new_v4());
        let (created, _) = self
            .ledger
            .create_if_absent(NewTransaction {
                provider: PaymentProvider::Internal,
                provider_tx_id: grant_id.clone(),
                merchant_order_id: grant_id,
                user_id,
                amount: 0,
                plan: Some(plan),
                duration_days: Some(duration_days),
                provider_create_time: None,
                raw_payload: None,
            })
            .await?;

        self.ledger
            .transition(&created, TransactionState::Completed, TransitionStamp::default())
            .await?;

        self.get_entitlement(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn paid(at_day: i64, duration_days: i32) -> CompletedPayment {
        CompletedPayment {
            paid_at: day(at_day),
            amount: 9_900,
            plan: SubscriptionPlan::Premium,
            duration_days,
            source: EntitlementSource::Payment,
        }
    }

    #[test]
    fn empty_ledger_projects_nothing() {
        assert!(project_expiry(&[]).is_none());
    }

    #[test]
    fn single_payment_window_starts_at_paid_time() {
        let projection = project_expiry(&[paid(0, 30)]).unwrap();
        assert_eq!(projection.expiry, day(30));
        assert_eq!(projection.first_paid_at, day(0));
    }

    #[test]
    fn overlapping_payments_stack_onto_running_expiry() {
        // Paid on day 0 and day 20, 30 days each: day 20 falls inside the
        // first window, so the second stacks -> expiry day 60.
        let projection = project_expiry(&[paid(0, 30), paid(20, 30)]).unwrap();
        assert_eq!(projection.expiry, day(60));
    }

    #[test]
    fn lapsed_window_restarts_at_late_payment() {
        // Paid on day 0 and day 50: the first window lapsed on day 30, so the
        // second restarts at day 50 -> expiry day 80. No retroactive credit.
        let projection = project_expiry(&[paid(0, 30), paid(50, 30)]).unwrap();
        assert_eq!(projection.expiry, day(80));
    }

    #[test]
    fn contiguous_chain_sums_durations() {
        // Every payment lands inside the projected window: t0 + sum(d).
        let payments = vec![paid(0, 30), paid(10, 30), paid(29, 30), paid(60, 30)];
        let projection = project_expiry(&payments).unwrap();
        assert_eq!(projection.expiry, day(120));
    }

    #[test]
    fn same_day_payments_stack() {
        let projection = project_expiry(&[paid(0, 30), paid(0, 30)]).unwrap();
        assert_eq!(projection.expiry, day(60));
    }

    #[test]
    fn projection_is_deterministic() {
        let payments = vec![paid(0, 30), paid(20, 90), paid(200, 30)];
        let first = project_expiry(&payments).unwrap();
        for _ in 0..10 {
            assert_eq!(project_expiry(&payments).unwrap(), first);
        }
    }

    #[test]
    fn projection_carries_last_payment_metadata() {
        let mut second = paid(10, 90);
        second.amount = 24_900;
        let projection = project_expiry(&[paid(0, 30), second]).unwrap();
        assert_eq!(projection.last_amount, 24_900);
        assert_eq!(projection.last_duration_days, 90);
        assert_eq!(projection.first_paid_at, day(0));
    }

    #[test]
    fn grant_source_wins_when_last() {
        let mut grant = paid(5, 14);
        grant.amount = 0;
        grant.source = EntitlementSource::Grant;
        let projection = project_expiry(&[paid(0, 30), grant]).unwrap();
        assert_eq!(projection.source, EntitlementSource::Grant);
        assert_eq!(projection.expiry, day(44));
    }
}
