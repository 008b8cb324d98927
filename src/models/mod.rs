// Ledger and entitlement entities
pub mod payment_transaction;
pub mod user_entitlement;

// Re-export common types for convenience
pub use payment_transaction::PaymentProvider;
pub use payment_transaction::TransactionState;
pub use user_entitlement::EntitlementSource;
pub use user_entitlement::SubscriptionPlan;

pub mod prelude {
    pub use super::payment_transaction::Entity as PaymentTransaction;
    pub use super::user_entitlement::Entity as UserEntitlement;

    pub use super::payment_transaction::PaymentProvider;
    pub use super::payment_transaction::TransactionState;
    pub use super::user_entitlement::EntitlementSource;
    pub use super::user_entitlement::SubscriptionPlan;
}
