//! Turning source files into artifacts.
//!
//! A [`Transformer`] handles one file format. The [`Registry`] maps file
//! extensions to transformers and is built once, before the first build, and
//! never changes afterwards.

pub mod dispatch;
pub mod svg;
#[cfg(feature = "wav")]
pub mod wav;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::paths::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output formats requested from transformers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    pub audio_formats: Vec<AudioFormat>,
}

/// One generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Artifact {
    /// One payload per requested audio format, keyed by format name.
    Audio {
        code: String,
        data: BTreeMap<String, String>,
    },
    NonAudio {
        code: String,
        data: String,
    },
}

impl Artifact {
    pub fn code(&self) -> &str {
        match self {
            Artifact::Audio { code, .. } | Artifact::NonAudio { code, .. } => code,
        }
    }
}

/// Everything a transformer produced for one source file, keyed by virtual
/// output path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactDescriptor(BTreeMap<String, Artifact>);

impl ArtifactDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artifact, failing if `path` is already taken.
    pub fn insert(&mut self, path: impl Into<String>, artifact: Artifact) -> anyhow::Result<()> {
        let path = path.into();
        if self.0.contains_key(&path) {
            anyhow::bail!("Artifact path '{path}' was generated more than once.");
        }
        self.0.insert(path, artifact);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&Artifact> {
        self.0.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What a transformer is asked to do.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub coord: Coordinate,
    /// Path of the source file.
    pub source: Utf8PathBuf,
    pub options: FormatOptions,
}

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(&self, request: &TransformRequest) -> anyhow::Result<ArtifactDescriptor>;
}

/// Transformers by file extension.
#[derive(Clone, Default)]
pub struct Registry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transformer this crate ships with.
    pub fn with_defaults() -> Self {
        let registry = Self::new().with("svg", svg::SvgTransformer);

        #[cfg(feature = "wav")]
        let registry = registry.with("wav", wav::WavTransformer);

        registry
    }

    /// Registers `transformer` for `extension`, replacing any previous one.
    pub fn with(mut self, extension: &str, transformer: impl Transformer + 'static) -> Self {
        self.transformers
            .insert(extension.to_ascii_lowercase(), Arc::new(transformer));
        self
    }

    pub fn get(&self, extension: &str) -> Option<&Arc<dyn Transformer>> {
        self.transformers.get(&extension.to_ascii_lowercase())
    }

    pub fn extensions(&self) -> Vec<&str> {
        let mut acc: Vec<&str> = self.transformers.keys().map(String::as_str).collect();
        acc.sort_unstable();
        acc
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("extensions", &self.extensions())
            .finish()
    }
}
