//! The file lifecycle API.
//!
//! Everything derived from one source file lives in its temp directory, with
//! the transformer's [`ArtifactDescriptor`] serialized to the coordinate's
//! cache file. Files of an unregistered format still get a cache file, holding
//! an empty mapping, so consumers see "no artifacts" instead of a failure.

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::Instrument;

use crate::engine::write::remove_path;
use crate::error::DispatchError;
use crate::paths::{Coordinate, PathNaming};
use crate::transform::{ArtifactDescriptor, FormatOptions, Registry, TransformRequest};

/// What a successful dispatch left on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchOutput {
    /// The serialized artifact descriptor.
    pub cache_file: Utf8PathBuf,
    /// Virtual paths of the generated artifacts.
    pub artifacts: Vec<String>,
}

/// Routes source files to the transformer registered for their extension.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    paths: Arc<dyn PathNaming>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, paths: Arc<dyn PathNaming>) -> Self {
        Self { registry, paths }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn paths(&self) -> &Arc<dyn PathNaming> {
        &self.paths
    }

    /// Transforms the file at `coord` and records its artifacts.
    pub async fn created(
        &self,
        coord: &Coordinate,
        options: &FormatOptions,
    ) -> Result<DispatchOutput, DispatchError> {
        self.perform_creation(coord, options)
            .instrument(span(coord))
            .await
    }

    /// Discards everything derived from the previous version of the file,
    /// then transforms it again.
    pub async fn updated(
        &self,
        coord: &Coordinate,
        options: &FormatOptions,
    ) -> Result<DispatchOutput, DispatchError> {
        async {
            self.perform_deletion(coord).await?;
            self.perform_creation(coord, options).await
        }
        .instrument(span(coord))
        .await
    }

    /// Removes everything derived from the file.
    pub async fn deleted(&self, coord: &Coordinate) -> Result<(), DispatchError> {
        self.perform_deletion(coord).instrument(span(coord)).await
    }

    async fn perform_deletion(&self, coord: &Coordinate) -> Result<(), DispatchError> {
        let temp = self.paths.temp(coord);
        tracing::info!("Deleting \"{temp}\"...");
        remove_path(&temp).await?;
        Ok(())
    }

    async fn perform_creation(
        &self,
        coord: &Coordinate,
        options: &FormatOptions,
    ) -> Result<DispatchOutput, DispatchError> {
        let temp = self.paths.temp(coord);
        tracing::info!("Creating \"{temp}\"...");

        fs::create_dir_all(&temp)
            .await
            .map_err(|source| DispatchError::Io {
                path: temp.clone(),
                source,
            })?;

        let descriptor = match self.registry.get(&coord.extension) {
            Some(transformer) => {
                let request = TransformRequest {
                    coord: coord.clone(),
                    source: self.paths.source(coord),
                    options: options.clone(),
                };

                transformer
                    .transform(&request)
                    .await
                    .map_err(|reason| DispatchError::Transform {
                        extension: coord.extension.clone(),
                        reason,
                    })?
            }
            None => {
                tracing::warn!(
                    "Unknown file extension \"{}\" for \"{}\".",
                    coord.extension,
                    self.paths.source(coord)
                );
                ArtifactDescriptor::new()
            }
        };

        let cache_file = self.paths.cache_file(coord);
        let json = serde_json::to_vec(&descriptor)?;

        tracing::debug!("Writing \"{cache_file}\"...");
        fs::write(&cache_file, json)
            .await
            .map_err(|source| DispatchError::Io {
                path: cache_file.clone(),
                source,
            })?;

        Ok(DispatchOutput {
            cache_file,
            artifacts: descriptor.paths().map(str::to_owned).collect(),
        })
    }
}

fn span(coord: &Coordinate) -> tracing::Span {
    tracing::info_span!(
        "dispatch",
        build = coord.build.as_str(),
        game = coord.game.as_str(),
        package = coord.package.as_str(),
        file = coord.file.as_str(),
        extension = coord.extension.as_str(),
    )
}
