//! Durable store for the workflow runtime: connection pool, runtime-applied
//! migrations, row models, and one hand-written query module per entity.
//!
//! This crate holds no scheduling logic; `forge-core` owns every state
//! transition and simply calls through these query functions.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
