use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription plan a user is entitled to.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionPlan {
    #[sea_orm(string_value = "free")]
    Free,
    #[sea_orm(string_value = "premium")]
    Premium,
}

impl SubscriptionPlan {
    pub fn is_free(self) -> bool {
        matches!(self, SubscriptionPlan::Free)
    }
}

/// Which mechanism granted the current entitlement.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntitlementSource {
    #[sea_orm(string_value = "payment")]
    Payment,
    #[sea_orm(string_value = "grant")]
    Grant,
}

/// Derived subscription projection for a user. Written exclusively by the
/// entitlement reconciler; every other component reads.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_entitlements")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub user_id: Uuid,
    pub plan: SubscriptionPlan,
    pub expiry_date: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub source: Option<EntitlementSource>,
    pub duration_days: Option<i32>,
    pub last_payment_amount: Option<i64>,
    #[sea_orm(column_type = "Text", nullable)]
    pub payment_status: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether the entitlement is active at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.plan.is_free() && self.expiry_date.map(|e| e > now).unwrap_or(false)
    }
}
