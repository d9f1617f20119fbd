//! Quota Service - resource-time ledger and metered usage quotas.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
