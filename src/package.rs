//! Packages: directories of source files that are transformed one by one.
//!
//! Every file of a package is an instance keyed by its file name. An edit
//! changes the content hash and so the fingerprint, which re-dispatches just
//! that file; a file removed from the package is deleted from the temp tree.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::core::Hash32;
use crate::engine::diff::Instance;
use crate::engine::instanced::{InstanceSource, InstancedOutput, InstancedStage, Lifecycle};
use crate::engine::{Inputs, StageContext};
use crate::paths::{Coordinate, DefaultPaths};
use crate::transform::{FormatOptions, Registry};
use crate::transform::dispatch::{DispatchOutput, Dispatcher};

/// A source file as seen by the diff. Any change to it re-runs the
/// transformer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceFile {
    pub file: String,
    pub extension: String,
    pub hash: Hash32,
    pub options: FormatOptions,
}

/// The stage type returned by [`package_files`].
pub type PackageStage = InstancedStage<SourceFile, PackageLifecycle, PackageSource>;

/// The output of a [`PackageStage`], keyed by file name.
pub type PackageOutput = InstancedOutput<DispatchOutput>;

/// Builds the stage transforming every file of `package` in `game`.
pub fn package_files(game: &str, package: &str, dispatcher: Dispatcher) -> PackageStage {
    let directory = dispatcher.paths().package_source(game, package);
    let watch = format!("{}/*", glob::Pattern::escape(directory.as_str()));

    let source = PackageSource {
        directory,
    };

    let lifecycle = PackageLifecycle {
        dispatcher,
        game: game.to_owned(),
        package: package.to_owned(),
    };

    InstancedStage::new(format!("package/{game}/{package}"), source, lifecycle).watch(watch)
}

/// Lists the files of a package directory.
pub struct PackageSource {
    directory: Utf8PathBuf,
}

#[async_trait]
impl InstanceSource<SourceFile> for PackageSource {
    async fn instances(
        &self,
        cx: &StageContext,
        _: &Inputs,
    ) -> anyhow::Result<Vec<Instance<SourceFile>>> {
        let options = FormatOptions {
            audio_formats: cx.config().audio_formats.clone(),
        };

        // Listing and hashing touch every file, keep it off the runtime.
        let directory = self.directory.clone();
        tokio::task::spawn_blocking(move || scan(&directory, &options)).await?
    }
}

fn scan(directory: &Utf8Path, options: &FormatOptions) -> anyhow::Result<Vec<Instance<SourceFile>>> {
    let entries = match directory.read_dir_utf8() {
        Ok(entries) => entries,
        // A package that is gone has no files, which deletes all of them.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(anyhow::anyhow!("Couldn't read package '{directory}': {e}")),
    };

    let mut instances = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let name = entry.file_name();
        let (file, extension) = split_name(name);

        instances.push(Instance::new(
            name,
            SourceFile {
                file: file.to_owned(),
                extension: extension.to_owned(),
                hash: Hash32::hash_file(entry.path())?,
                options: options.clone(),
            },
        ));
    }

    Ok(instances)
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((file, extension)) if !file.is_empty() => (file, extension),
        _ => (name, ""),
    }
}

/// Dispatches package files to their transformers.
pub struct PackageLifecycle {
    dispatcher: Dispatcher,
    game: String,
    package: String,
}

impl PackageLifecycle {
    fn coordinate(&self, cx: &StageContext, key: &str) -> Coordinate {
        let (file, extension) = split_name(key);
        Coordinate::new(cx.env.build, &self.game, &self.package, file, extension)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl Lifecycle<SourceFile> for PackageLifecycle {
    type Output = DispatchOutput;

    async fn created(
        &self,
        cx: &StageContext,
        key: &str,
        content: &SourceFile,
    ) -> anyhow::Result<DispatchOutput> {
        let coord = self.coordinate(cx, key);
        Ok(self.dispatcher.created(&coord, &content.options).await?)
    }

    async fn updated(
        &self,
        cx: &StageContext,
        key: &str,
        _: &DispatchOutput,
        content: &SourceFile,
    ) -> anyhow::Result<DispatchOutput> {
        let coord = self.coordinate(cx, key);
        Ok(self.dispatcher.updated(&coord, &content.options).await?)
    }

    async fn deleted(&self, cx: &StageContext, key: &str, _: &DispatchOutput) -> anyhow::Result<()> {
        self.discarded(cx, key).await
    }

    // Everything a file produces lives under its coordinate, so the key is
    // enough to find it.
    async fn discarded(&self, cx: &StageContext, key: &str) -> anyhow::Result<()> {
        let coord = self.coordinate(cx, key);
        Ok(self.dispatcher.deleted(&coord).await?)
    }
}

/// Source paths of the files a package build created or modified.
pub fn changed_sources(directory: &Utf8Path, output: &PackageOutput) -> HashSet<Utf8PathBuf> {
    output
        .changes
        .touched()
        .map(|key| directory.join(key))
        .collect()
}

/// Shorthand for the dispatcher most pipelines use.
pub fn default_dispatcher(config: &Config) -> Dispatcher {
    Dispatcher::new(
        Arc::new(Registry::with_defaults()),
        Arc::new(DefaultPaths::from_config(config)),
    )
}
