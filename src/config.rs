//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration file. Programmatic setup uses the chained setters:
//!
//! ```rust,no_run
//! use stagehand::{BuildName, Config};
//!
//! let config = Config::default()
//!     .source_dir("assets")
//!     .build(BuildName::Watch)
//!     .concurrency(4);
//! ```

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::BuildName;
use crate::error::ConfigError;
use crate::transform::AudioFormat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Root of the source tree, containing `<game>/<package>/<file>.<ext>`.
    pub source_dir: Utf8PathBuf,
    /// Root of intermediate per-file cache directories.
    pub temp_dir: Utf8PathBuf,
    /// Root of final build output.
    pub dist_dir: Utf8PathBuf,
    /// Where the cache store is persisted between processes.
    pub state_file: Option<Utf8PathBuf>,
    /// Maximum number of instance operations in flight per stage.
    pub concurrency: usize,
    /// Audio formats requested from audio transformers.
    pub audio_formats: Vec<AudioFormat>,
    /// The kind of build.
    pub build: BuildName,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: "src".into(),
            temp_dir: ".cache".into(),
            dist_dir: "dist".into(),
            state_file: Some(".cache/state.cbor".into()),
            concurrency: default_concurrency(),
            audio_formats: vec![AudioFormat::Wav],
            build: BuildName::OneOff,
        }
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        let mut config: Config =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;

        config.concurrency = config.concurrency.max(1);
        Ok(config)
    }

    /// Places every directory, and the state file, under `root`.
    pub fn rooted(root: impl AsRef<Utf8Path>) -> Self {
        let root = root.as_ref();
        Self {
            source_dir: root.join("src"),
            temp_dir: root.join(".cache"),
            dist_dir: root.join("dist"),
            state_file: Some(root.join(".cache/state.cbor")),
            ..Self::default()
        }
    }

    pub fn source_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.source_dir = path.into();
        self
    }

    pub fn temp_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.temp_dir = path.into();
        self
    }

    pub fn dist_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.dist_dir = path.into();
        self
    }

    /// Set to `None` to keep the cache store in memory only.
    pub fn state_file(mut self, path: Option<Utf8PathBuf>) -> Self {
        self.state_file = path;
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    pub fn audio_formats(mut self, formats: impl IntoIterator<Item = AudioFormat>) -> Self {
        self.audio_formats = formats.into_iter().collect();
        self
    }

    pub fn build(mut self, build: BuildName) -> Self {
        self.build = build;
        self
    }
}
