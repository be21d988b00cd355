//! Core coordination and collection engine for the application-autoscaler
//! metrics collector: a database-backed singleton lease arbitrating which
//! replica drives collection, and a per-application polling supervisor
//! that fans out to one App Poller per known application.

pub mod config;
pub mod lease;
pub mod lock;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod sink;
pub mod supervisor;
pub mod telemetry;
