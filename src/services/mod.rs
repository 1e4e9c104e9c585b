pub mod cancellation;
pub mod commerce;
pub mod inventory;
pub mod order_status;
pub mod orders;
pub mod payments;
pub mod reconciliation;
