// External collaborators
pub mod accounts;
pub mod token_provider;

// Ledger and reconciliation
pub mod entitlement;
pub mod ledger;
pub mod sweep;
