//! Typed error hierarchy for the site worker.
//!
//! One enum per collaborator the run state machine talks to:
//! - `RouterError`: control-plane requests
//! - `ArtifactError`: local artifact store
//! - `CacheError`: status snapshot store
//! - `RegistryError`: task plugin resolution
//! - `ConfigError`: configuration validation

use fedrun_common::RunStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the router client. None of these are retried in place; the
/// next dispatch of the run is the retry.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Router request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Router returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode router response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Run {run_id} is not known to the router")]
    UnknownRun { run_id: String },

    #[error("Router rejected transition of run {run_id} to {status}: {reason}")]
    Rejected {
        run_id: String,
        status: RunStatus,
        reason: String,
    },

    #[error("Failed to build router request: {0}")]
    Request(String),
}

/// Errors from the local artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact address is incomplete: run '{run_id}', task {task_seq}, round {round_seq}")]
    InvalidAddress {
        run_id: String,
        task_seq: usize,
        round_seq: u64,
    },

    #[error("Failed to read artifact at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write artifact at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact I/O task did not complete: {0}")]
    Interrupted(String),
}

/// Errors from a status snapshot store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Snapshot store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt snapshot for run {run_id}: {source}")]
    Corrupt {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Errors resolving a run's task handler.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No task handler registered for model '{model}' (known: {known})")]
    UnknownModel { model: String, known: String },

    #[error("Run {run_id} has no active task step (cur_seq {cur_seq} of {task_count})")]
    NoActiveStep {
        run_id: String,
        cur_seq: usize,
        task_count: usize,
    },
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting '{setting}' (set {env} or [{section}] in fedrun.toml)")]
    Missing {
        setting: &'static str,
        env: &'static str,
        section: &'static str,
    },

    #[error("Invalid value for '{setting}': {message}")]
    Invalid {
        setting: &'static str,
        message: String,
    },
}
