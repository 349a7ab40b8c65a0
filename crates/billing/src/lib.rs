#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subscription lifecycle and payment reconciliation engine.
//!
//! The core promise: side effects happen exactly once under at-least-once
//! webhook delivery. Every mutation is a conditional update against the
//! relational store; replays and concurrent deliveries converge on the state
//! the first writer committed.

pub mod capabilities;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod links;
pub mod models;
pub mod monitor;
pub mod normalize;
pub mod notify;
pub mod payments;
pub mod proxy;
pub mod referrals;
pub mod signature;
pub mod telegram;
pub mod webhooks;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

#[cfg(test)]
mod lifecycle_tests;

pub use error::{BillingError, BillingResult};
pub use models::{PaymentRecord, PaymentStatus, VpnKey};
pub use webhooks::{WebhookOutcome, WebhookReconciler};
