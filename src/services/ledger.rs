use crate::{
    errors::ServiceError,
    events::{Event, EventSender},
    models::payment_transaction::{self, PaymentProvider, TransactionState},
    models::SubscriptionPlan,
};
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Fields establishing a new ledger record.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub provider: PaymentProvider,
    pub provider_tx_id: String,
    pub merchant_order_id: String,
    pub user_id: Uuid,
    pub amount: i64,
    pub plan: Option<SubscriptionPlan>,
    pub duration_days: Option<i32>,
    pub provider_create_time: Option<i64>,
    pub raw_payload: Option<serde_json::Value>,
}

/// Fields stamped onto a record during a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionStamp {
    pub reason_code: Option<i32>,
    pub raw_payload: Option<serde_json::Value>,
}

/// The provider-scoped, append-only transaction ledger. Owns every mutation
/// of `payment_transactions`; the per-provider state table is enforced here,
/// at the persistence boundary, so no call path can corrupt a record.
pub struct TransactionLedger {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl TransactionLedger {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Create a transaction in the initial state unless one already exists
    /// for `(provider, provider_tx_id)`. Returns the record and whether this
    /// call inserted it.
    #[instrument(skip(self, new), fields(provider = %new.provider, provider_tx_id = %new.provider_tx_id))]
    pub async fn create_if_absent(
        &self,
        new: NewTransaction,
    ) -> Result<(payment_transaction::Model, bool), ServiceError> {
        if let Some(existing) = self
            .find_by_provider_tx(new.provider, &new.provider_tx_id)
            .await?
        {
            let existing = self.bump_retry_count(existing).await?;
            return Ok((existing, false));
        }

        let now = Utc::now();
        let model = payment_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            provider: Set(new.provider),
            provider_tx_id: Set(new.provider_tx_id.clone()),
            merchant_order_id: Set(new.merchant_order_id),
            user_id: Set(new.user_id),
            amount: Set(new.amount),
            state: Set(TransactionState::Created),
            reason_code: Set(None),
            plan: Set(new.plan),
            duration_days: Set(new.duration_days),
            provider_create_time: Set(new.provider_create_time),
            retry_count: Set(0),
            raw_payload: Set(new.raw_payload),
            created_at: Set(now),
            performed_at: Set(None),
            cancelled_at: Set(None),
            updated_at: Set(Some(now)),
        };

        let inserted = match model.insert(&*self.db).await {
            Ok(inserted) => inserted,
            // Unique index on (provider, provider_tx_id): a concurrent create
            // won the race; return its record.
            Err(e) => {
                if let Some(existing) = self
                    .find_by_provider_tx(new.provider, &new.provider_tx_id)
                    .await?
                {
                    warn!("concurrent create detected, returning existing record");
                    return Ok((existing, false));
                }
                return Err(ServiceError::DatabaseError(e));
            }
        };

        info!(transaction_id = %inserted.id, user_id = %inserted.user_id, "transaction created");

        if let Err(e) = self
            .event_sender
            .send(Event::TransactionCreated {
                transaction_id: inserted.id,
                provider: inserted.provider,
                user_id: inserted.user_id,
                amount: inserted.amount,
            })
            .await
        {
            warn!(error = %e, "failed to send transaction-created event");
        }

        Ok((inserted, true))
    }

    /// Apply a state transition, enforcing the transition table.
    ///
    /// Returns the record and whether a write happened. Repeating a
    /// transition the record is already in is an idempotent no-op; an edge
    /// outside the table is rejected and logged as a defect.
    #[instrument(skip(self, stamp), fields(transaction_id = %tx.id))]
    pub async fn transition(
        &self,
        tx: &payment_transaction::Model,
        target: TransactionState,
        stamp: TransitionStamp,
    ) -> Result<(payment_transaction::Model, bool), ServiceError> {
        if tx.state == target {
            // Duplicate delivery of a transition we already applied.
            let tx = self.bump_retry_count(tx.clone()).await?;
            return Ok((tx, false));
        }

        if !tx.state.can_transition_to(target) {
            error!(
                from = %tx.state,
                to = %target,
                "illegal state transition rejected at ledger boundary"
            );
            return Err(ServiceError::InvalidStateTransition(format!(
                "transaction {} cannot move from {} to {}",
                tx.id, tx.state, target
            )));
        }

        let now = Utc::now();
        let mut update = payment_transaction::Entity::update_many()
            .col_expr(payment_transaction::Column::State, Expr::value(target))
            .col_expr(
                payment_transaction::Column::UpdatedAt,
                Expr::value(Some(now)),
            )
            .filter(payment_transaction::Column::Id.eq(tx.id))
            // Guard: only move off the state we loaded, so concurrent
            // deliveries apply a transition exactly once.
            .filter(payment_transaction::Column::State.eq(tx.state));

        match target {
            TransactionState::Completed => {
                update = update.col_expr(
                    payment_transaction::Column::PerformedAt,
                    Expr::value(Some(now)),
                );
            }
            TransactionState::Cancelled | TransactionState::CancelledAfterComplete => {
                update = update.col_expr(
                    payment_transaction::Column::CancelledAt,
                    Expr::value(Some(now)),
                );
                if let Some(reason) = stamp.reason_code {
                    update = update.col_expr(
                        payment_transaction::Column::ReasonCode,
                        Expr::value(Some(reason)),
                    );
                }
            }
            TransactionState::Created => unreachable!("no edge leads back to created"),
        }

        if let Some(ref payload) = stamp.raw_payload {
            update = update.col_expr(
                payment_transaction::Column::RawPayload,
                Expr::value(Some(payload.clone())),
            );
        }

        let result = update.exec(&*self.db).await?;

        if result.rows_affected == 0 {
            // Lost a race: someone else transitioned this record first.
            let current = self
                .find_by_provider_tx(tx.provider, &tx.provider_tx_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", tx.id)))?;
            if current.state == target {
                return Ok((current, false));
            }
            return Err(ServiceError::ConcurrentModification(tx.id));
        }

        let updated = self
            .find_by_provider_tx(tx.provider, &tx.provider_tx_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction {}", tx.id)))?;

        info!(from = %tx.state, to = %target, "transaction state changed");

        let event = match target {
            TransactionState::Completed => Event::TransactionCompleted {
                transaction_id: updated.id,
                provider: updated.provider,
                user_id: updated.user_id,
                amount: updated.amount,
                performed_at: updated.performed_at.unwrap_or(now),
            },
            _ => Event::TransactionCancelled {
                transaction_id: updated.id,
                provider: updated.provider,
                user_id: updated.user_id,
                reason_code: updated.reason_code,
            },
        };
        if let Err(e) = self.event_sender.send(event).await {
            warn!(error = %e, "failed to send transaction event");
        }

        Ok((updated, true))
    }

    /// Record a redelivery of an already-settled protocol call.
    async fn bump_retry_count(
        &self,
        tx: payment_transaction::Model,
    ) -> Result<payment_transaction::Model, ServiceError> {
        payment_transaction::Entity::update_many()
            .col_expr(
                payment_transaction::Column::RetryCount,
                Expr::col(payment_transaction::Column::RetryCount).add(1),
            )
            .filter(payment_transaction::Column::Id.eq(tx.id))
            .exec(&*self.db)
            .await?;

        Ok(payment_transaction::Model {
            retry_count: tx.retry_count + 1,
            ..tx
        })
    }

    pub async fn find_by_provider_tx(
        &self,
        provider: PaymentProvider,
        provider_tx_id: &str,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::Provider.eq(provider))
            .filter(payment_transaction::Column::ProviderTxId.eq(provider_tx_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    pub async fn find_by_order_id(
        &self,
        provider: PaymentProvider,
        merchant_order_id: &str,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::Provider.eq(provider))
            .filter(payment_transaction::Column::MerchantOrderId.eq(merchant_order_id))
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// All completed transactions for a user, across every provider, ordered
    /// by paid time ascending. The input to the stacking fold.
    pub async fn completed_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::UserId.eq(user_id))
            .filter(payment_transaction::Column::State.eq(TransactionState::Completed))
            .order_by_asc(payment_transaction::Column::PerformedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Full per-user audit listing, newest first.
    pub async fn transactions_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::UserId.eq(user_id))
            .order_by_desc(payment_transaction::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Distinct users owning at least one completed transaction; drives the
    /// sweep's activation pass.
    pub async fn users_with_completed(&self) -> Result<Vec<Uuid>, ServiceError> {
        let rows: Vec<Uuid> = payment_transaction::Entity::find()
            .select_only()
            .column(payment_transaction::Column::UserId)
            .filter(payment_transaction::Column::State.eq(TransactionState::Completed))
            .distinct()
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(rows)
    }

    /// Transactions still `created` before `cutoff`, eligible for timeout
    /// cancellation.
    pub async fn stale_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::State.eq(TransactionState::Created))
            .filter(payment_transaction::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }
}
