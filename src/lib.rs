// ABOUTME: Library root for warehouse-mirror
// ABOUTME: Exposes the pipeline, its collaborators, and their PostgreSQL implementations

pub mod commands;
pub mod config;
pub mod filters;
pub mod mirror;
pub mod notify;
pub mod postgres;
pub mod source;
pub mod utils;
pub mod warehouse;
