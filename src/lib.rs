//! fleetplay - idempotent remote provisioning
//!
//! This crate turns an inventory of hosts, a playbook of intended-state task
//! declarations, templates and run-time injected variables into the minimal
//! set of remote changes, applied over SSH and reported per host and task.

pub mod apply;
pub mod config;
pub mod connection;
pub mod error;
pub mod facts;
pub mod inventory;
pub mod playbook;
pub mod report;
