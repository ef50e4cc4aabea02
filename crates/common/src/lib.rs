//! leasemgr-common: shared domain types, error kinds, and notification
//! payloads for the lease scheduler workspace.

pub mod error;
pub mod filter;
pub mod model;
pub mod notification;
