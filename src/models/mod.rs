pub mod invoice;
pub mod payment;
pub mod user;
