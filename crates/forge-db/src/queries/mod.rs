//! Hand-written query modules, one per entity in the data model.

pub mod agent_runs;
pub mod dead_letters;
pub mod projects;
pub mod pull_requests;
pub mod runner_events;
pub mod steps;
pub mod workflows;
