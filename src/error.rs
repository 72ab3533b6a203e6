use std::fmt::Write as _;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

/// One instance of an [`InstancedStage`](crate::InstancedStage) that failed to
/// be created, updated or deleted.
#[derive(Debug)]
pub struct InstanceFailure {
    /// Key of the failed instance.
    pub key: String,
    /// The underlying failure.
    pub error: anyhow::Error,
}

impl std::fmt::Display for InstanceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}': {:#}", self.key, self.error)
    }
}

fn list_failures(failures: &[InstanceFailure]) -> String {
    let mut acc = String::new();
    for failure in failures {
        let _ = write!(acc, "\n  - {failure}");
    }
    acc
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Instance key '{key}' was produced more than once")]
    KeyCollision { key: String },

    #[error("{} of {total} instances failed:{}", .failures.len(), list_failures(.failures))]
    Instances {
        failures: Vec<InstanceFailure>,
        total: usize,
    },

    #[error("Stage '{stage}' received an input of unexpected type")]
    Input { stage: String },

    #[error("Stage panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Failures of individual instances, empty for stage-wide errors.
    pub fn instance_failures(&self) -> &[InstanceFailure] {
        match self {
            StageError::Instances { failures, .. } => failures,
            _ => &[],
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Couldn't create directory '{path}'.\n{source}")]
    CreateDir {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't write file '{path}'.\n{source}")]
    Write {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't remove '{path}'.\n{source}")]
    Remove {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't access cache state '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't encode cache state.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode cache state.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("I/O error at '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't serialize artifacts.\n{0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Transformer for '.{extension}' failed.\n{reason:#}")]
    Transform {
        extension: String,
        reason: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse configuration '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Cycle detected in stage graph at '{stage}'")]
    Cycle { stage: String },

    #[error("Stage name '{stage}' is used more than once")]
    DuplicateStage { stage: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Build failed in {} stage(s): {}", .stages.len(), .stages.join(", "))]
    Failed { stages: Vec<String> },
}

#[derive(Debug, Error)]
pub enum RegenerateError {
    #[error("Couldn't generate favicons.\n{0:#}")]
    Favicons(anyhow::Error),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("Favicon writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
