//! Infrastructure layer: durable job system, job definitions, configuration.

pub mod config;
pub mod jobs;
