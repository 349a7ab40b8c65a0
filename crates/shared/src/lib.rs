#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared infrastructure for the keygate workspace.
//!
//! Holds the database pool helpers, schema migrations and the immutable plan
//! configuration table that every service component receives at construction.

pub mod db;
pub mod plans;

pub use db::{create_pool, run_migrations};
pub use plans::{Plan, PlanTable};
