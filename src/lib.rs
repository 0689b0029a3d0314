//! acp-registry - validation, publication and version reconciliation for ACP agent manifests

pub mod accessibility;
pub mod commands;
pub mod config;
pub mod icon;
pub mod launch;
pub mod models;
pub mod reconcile;
pub mod registry;
pub mod scanner;
pub mod upstream;
pub mod validation;
pub mod version;
