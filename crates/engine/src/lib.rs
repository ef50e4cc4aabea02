//! The lease scheduler and lifecycle engine: construction, time-ordered
//! execution, plugin dispatch, and status-machine invariants for
//! multi-tenant resource reservations.

pub mod config;
pub mod enforcement;
pub mod error;
pub mod event_engine;
pub mod lease_service;
pub mod lifecycle;
pub mod monitor;
pub mod notification;
pub mod ordering;
pub mod plugins;
pub mod repository;
pub mod runtime;
pub mod startup;
pub mod status_machine;

pub use error::EngineResult;
