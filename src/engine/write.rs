//! Materializing content on disk.
//!
//! A [`WriteFileStage`] owns exactly one destination path and keeps the file
//! there in sync with one content value. The destination is recomputed from
//! its factory at the start of every operation, since whatever names the file
//! may have been renamed since the last build.

use std::borrow::Cow;
use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;

use crate::engine::diff::Instance;
use crate::engine::instanced::{FanOut, InstancedOutput, InstancedStage, Lifecycle, reconcile};
use crate::engine::{Inputs, Stage, StageContext};
use crate::error::{StageError, WriteError};

/// Computes a path on demand.
pub type PathFactory = Arc<dyn Fn() -> Utf8PathBuf + Send + Sync>;

type ContentsFn = Arc<dyn Fn(&StageContext, &Inputs) -> anyhow::Result<Vec<u8>> + Send + Sync>;

/// Content bound for a destination.
///
/// The destination takes part in the fingerprint, so moving a file is seen as
/// an update even when its bytes did not change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileContents {
    pub destination: Utf8PathBuf,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct WriteFileStage {
    name: Cow<'static, str>,
    destination: PathFactory,
    contents: Option<ContentsFn>,
}

impl WriteFileStage {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        destination: impl Fn() -> Utf8PathBuf + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            destination: Arc::new(destination),
            contents: None,
        }
    }

    /// Gives the stage its own content, which makes it usable as a
    /// standalone [`Stage`] in a graph.
    pub fn contents<F>(mut self, contents: F) -> Self
    where
        F: Fn(&StageContext, &Inputs) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.contents = Some(Arc::new(contents));
        self
    }

    /// Where the file belongs right now.
    pub fn destination(&self) -> Utf8PathBuf {
        (self.destination)()
    }

    /// Writes `content` to the destination, creating missing directories.
    /// Leaves the file untouched when it already holds exactly `content`.
    pub async fn created(&self, content: &[u8]) -> Result<Utf8PathBuf, WriteError> {
        let path = self.destination();

        if let Ok(existing) = fs::read(&path).await
            && existing == content
        {
            tracing::debug!(path = %path, "already up to date");
            return Ok(path);
        }

        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| WriteError::CreateDir {
                    path: parent.to_owned(),
                    source,
                })?;
        }

        fs::write(&path, content)
            .await
            .map_err(|source| WriteError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path, bytes = content.len(), "wrote file");
        Ok(path)
    }

    /// Replaces the file last written at `previous`. When the destination
    /// moved, the old path is removed before anything is written.
    pub async fn updated(
        &self,
        previous: &Utf8Path,
        content: &[u8],
    ) -> Result<Utf8PathBuf, WriteError> {
        if previous != self.destination() {
            self.deleted(previous).await?;
        }

        self.created(content).await
    }

    /// Removes `path` and anything below it. A missing path is fine.
    pub async fn deleted(&self, path: &Utf8Path) -> Result<(), WriteError> {
        remove_path(path).await
    }
}

pub(crate) async fn remove_path(path: &Utf8Path) -> Result<(), WriteError> {
    let remove = |source| WriteError::Remove {
        path: path.to_owned(),
        source,
    };

    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::debug!(path = %path, "removed");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(remove(e)),
    }
}

#[async_trait]
impl Lifecycle<FileContents> for WriteFileStage {
    type Output = Utf8PathBuf;

    async fn created(
        &self,
        _: &StageContext,
        _: &str,
        content: &FileContents,
    ) -> anyhow::Result<Utf8PathBuf> {
        Ok(WriteFileStage::created(self, &content.bytes).await?)
    }

    async fn updated(
        &self,
        _: &StageContext,
        _: &str,
        previous: &Utf8PathBuf,
        content: &FileContents,
    ) -> anyhow::Result<Utf8PathBuf> {
        Ok(WriteFileStage::updated(self, previous, &content.bytes).await?)
    }

    async fn deleted(&self, _: &StageContext, _: &str, previous: &Utf8PathBuf) -> anyhow::Result<()> {
        Ok(WriteFileStage::deleted(self, previous).await?)
    }

    // Without a recorded path, the only candidate is the current destination.
    async fn discarded(&self, _: &StageContext, _: &str) -> anyhow::Result<()> {
        Ok(remove_path(&self.destination()).await?)
    }
}

#[async_trait]
impl Stage for WriteFileStage {
    type Output = Utf8PathBuf;

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    async fn run(&self, cx: &StageContext, inputs: &Inputs) -> Result<Utf8PathBuf, StageError> {
        let Some(contents) = &self.contents else {
            return Err(anyhow::anyhow!("write stage '{}' has no contents", self.name).into());
        };

        let file = FileContents {
            destination: self.destination(),
            bytes: contents(cx, inputs)?,
        };

        let key = self.name.to_string();
        let output = reconcile(cx, &Arc::new(self.clone()), vec![Instance::new(&key, file)]).await?;

        output
            .items
            .get(&key)
            .cloned()
            .ok_or_else(|| StageError::Other(anyhow::anyhow!("'{key}' was not written")))
    }
}

/// Output of [`write_files`]: for every file name, the path it was written to.
pub type WrittenFiles = InstancedOutput<InstancedOutput<Utf8PathBuf>>;

/// A stage writing a set of named files below a common prefix.
///
/// Every file is owned by its own [`WriteFileStage`] with destination
/// `prefix() / name`. Files that disappear from the set are removed, and when
/// the prefix moves every file is moved with it.
pub fn write_files<F, P>(
    name: impl Into<Cow<'static, str>>,
    files: F,
    prefix: P,
) -> impl Stage<Output = WrittenFiles>
where
    F: Fn(&StageContext, &Inputs) -> anyhow::Result<Vec<(String, Vec<u8>)>> + Send + Sync + 'static,
    P: Fn() -> Utf8PathBuf + Send + Sync + 'static,
{
    let prefix: PathFactory = Arc::new(prefix);

    let source = {
        let prefix = prefix.clone();
        move |cx: &StageContext, inputs: &Inputs| -> anyhow::Result<Vec<Instance<FileContents>>> {
            let root = prefix();
            let instances = files(cx, inputs)?
                .into_iter()
                .map(|(name, bytes)| {
                    let destination = root.join(&name);
                    Instance::new(name, FileContents { destination, bytes })
                })
                .collect();

            Ok(instances)
        }
    };

    let children = FanOut::new(
        move |key: &str| {
            let prefix = prefix.clone();
            let file = key.to_owned();
            WriteFileStage::new(key.to_owned(), move || prefix().join(&file))
        },
        |key: &str, file: &FileContents| anyhow::Ok(vec![Instance::new(key, file.clone())]),
    );

    InstancedStage::new(name, source, children)
}
