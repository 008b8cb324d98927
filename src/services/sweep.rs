use crate::{
    config::AppConfig,
    errors::ServiceError,
    events::{Event, EventSender},
    models::{
        payment_transaction::reason,
        user_entitlement::{self, SubscriptionPlan},
        TransactionState,
    },
    services::{
        entitlement::{EntitlementService, ReconcileOutcome},
        ledger::{TransactionLedger, TransitionStamp},
    },
};
use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Counts reported by one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct SweepReport {
    /// Non-free entitlements whose expiry had passed, reverted to free.
    pub expired: u64,
    /// Non-free entitlements with a missing expiry, reverted to free.
    pub repaired: u64,
    /// Free users with a valid stacked window, activated.
    pub activated: u64,
    /// Pending transactions past the timeout window, cancelled.
    pub timed_out_transactions: u64,
    /// Users or transactions the sweep could not process.
    pub errors: u64,
}

/// Periodic repair job over the whole user set.
///
/// Each pass is independent, order-independent, and safe to re-run; an
/// interrupted sweep leaves nothing half-done that the next run cannot pick
/// up, because every mutation goes through the reconciler or the ledger.
pub struct ReconciliationSweep {
    db: Arc<DatabaseConnection>,
    ledger: Arc<TransactionLedger>,
    entitlements: Arc<EntitlementService>,
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
}

impl ReconciliationSweep {
    pub fn new(
        db: Arc<DatabaseConnection>,
        ledger: Arc<TransactionLedger>,
        entitlements: Arc<EntitlementService>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            ledger,
            entitlements,
            config,
            event_sender,
        }
    }

    /// Run all passes and report counts.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<SweepReport, ServiceError> {
        let mut report = SweepReport::default();

        self.downgrade_lapsed(&mut report).await;
        self.downgrade_missing_expiry(&mut report).await;
        self.activate_eligible(&mut report).await;
        self.cancel_timed_out(&mut report).await;

        info!(
            expired = report.expired,
            repaired = report.repaired,
            activated = report.activated,
            timed_out = report.timed_out_transactions,
            errors = report.errors,
            "reconciliation sweep finished"
        );

        let _ = self
            .event_sender
            .send(Event::SweepCompleted {
                expired: report.expired,
                repaired: report.repaired,
                activated: report.activated,
                errors: report.errors,
            })
            .await;

        Ok(report)
    }

    async fn reconcile_counting(&self, user_id: Uuid, report: &mut SweepReport) {
        match self.entitlements.reconcile_user(user_id).await {
            Ok(ReconcileOutcome::Expired) => report.expired += 1,
            Ok(ReconcileOutcome::Repaired) => report.repaired += 1,
            Ok(ReconcileOutcome::Activated) => report.activated += 1,
            Ok(ReconcileOutcome::Unchanged) => {}
            Err(e) => {
                error!(%user_id, error = %e, "sweep reconciliation failed for user");
                report.errors += 1;
            }
        }
    }

    /// Pass (i): every non-free user whose expiry has passed.
    async fn downgrade_lapsed(&self, report: &mut SweepReport) {
        let now = Utc::now();
        let users = user_entitlement::Entity::find()
            .select_only()
            .column(user_entitlement::Column::UserId)
            .filter(user_entitlement::Column::Plan.ne(SubscriptionPlan::Free))
            .filter(user_entitlement::Column::ExpiryDate.lte(now))
            .into_tuple::<Uuid>()
            .all(&*self.db)
            .await;

        match users {
            Ok(users) => {
                for user_id in users {
                    self.reconcile_counting(user_id, report).await;
                }
            }
            Err(e) => {
                error!(error = %e, "sweep could not list lapsed entitlements");
                report.errors += 1;
            }
        }
    }

    /// Pass (ii): every non-free user with a missing expiry.
    async fn downgrade_missing_expiry(&self, report: &mut SweepReport) {
        let users = user_entitlement::Entity::find()
            .select_only()
            .column(user_entitlement::Column::UserId)
            .filter(user_entitlement::Column::Plan.ne(SubscriptionPlan::Free))
            .filter(user_entitlement::Column::ExpiryDate.is_null())
            .into_tuple::<Uuid>()
            .all(&*self.db)
            .await;

        match users {
            Ok(users) => {
                for user_id in users {
                    self.reconcile_counting(user_id, report).await;
                }
            }
            Err(e) => {
                error!(error = %e, "sweep could not list entitlements with missing expiry");
                report.errors += 1;
            }
        }
    }

    /// Pass (iii): every free (or entirely absent) entitlement whose ledger
    /// holds completed transactions. Repairs the case where a gateway crashed
    /// between the ledger write and the reconciliation call.
    async fn activate_eligible(&self, report: &mut SweepReport) {
        let candidates = match self.ledger.users_with_completed().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "sweep could not list users with completed transactions");
                report.errors += 1;
                return;
            }
        };

        let non_free: HashSet<Uuid> = match user_entitlement::Entity::find()
            .select_only()
            .column(user_entitlement::Column::UserId)
            .filter(user_entitlement::Column::Plan.ne(SubscriptionPlan::Free))
            .into_tuple::<Uuid>()
            .all(&*self.db)
            .await
        {
            Ok(users) => users.into_iter().collect(),
            Err(e) => {
                error!(error = %e, "sweep could not list active entitlements");
                report.errors += 1;
                return;
            }
        };

        for user_id in candidates {
            if non_free.contains(&user_id) {
                continue;
            }
            self.reconcile_counting(user_id, report).await;
        }
    }

    /// Pass (iv): cancel transactions that stayed pending past the timeout
    /// window instead of trusting the provider to always deliver the cancel.
    async fn cancel_timed_out(&self, report: &mut SweepReport) {
        let cutoff = Utc::now() - Duration::hours(self.config.pending_timeout_hours);
        let stale = match self.ledger.stale_created_before(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "sweep could not list stale pending transactions");
                report.errors += 1;
                return;
            }
        };

        for tx in stale {
            match self
                .ledger
                .transition(
                    &tx,
                    TransactionState::Cancelled,
                    TransitionStamp {
                        reason_code: Some(reason::TIMEOUT),
                        raw_payload: None,
                    },
                )
                .await
            {
                Ok((_, true)) => report.timed_out_transactions += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    error!(transaction_id = %tx.id, error = %e, "sweep could not cancel stale transaction");
                    report.errors += 1;
                }
            }
        }
    }
}
