//! HTTP handlers for quota-service.

pub mod balance;
pub mod events;
pub mod quota;

pub use balance::*;
pub use events::*;
pub use quota::*;
