//! API Routes
//!
//! Route handlers organized by functionality.

pub mod feeds;
pub mod filters;
pub mod health;
pub mod subscriptions;
