//! Core library for axiom — shared types, the task registry, and settings.
//!
//! This crate is the foundation of the axiom supervisor and provides:
//! - The task data model (tasks, agent instances, orthogonal subtasks)
//! - The concurrent task registry with lifecycle transitions and watchers
//! - JSON settings with compiled-in defaults

pub mod config;
pub mod registry;
pub mod types;
