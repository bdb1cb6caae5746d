pub mod balance;
pub mod mpesa_gateway;
pub mod reconciliation;
