pub mod diff;
pub mod instanced;
pub(crate) mod runner;
pub mod write;

use std::any::type_name;
use std::borrow::Cow;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8Path;
use petgraph::graph::NodeIndex;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::core::{ArcStr, Dynamic, Environment, Hash32};
use crate::error::StageError;

/// Everything a stage can see while it runs.
///
/// Cheap to clone, so instance jobs can carry their own copy onto the
/// runtime.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Global build environment.
    pub env: Arc<Environment>,
    /// Persistent instance records.
    pub cache: Arc<CacheStore>,
    stage: ArcStr,
}

impl StageContext {
    pub fn new(env: Arc<Environment>, cache: Arc<CacheStore>, stage: &str) -> Self {
        Self {
            env,
            cache,
            stage: stage.into(),
        }
    }

    /// Name of the running stage, which is also its cache namespace.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    /// The same context, namespaced for another stage.
    pub fn for_stage(&self, stage: &str) -> Self {
        Self {
            env: self.env.clone(),
            cache: self.cache.clone(),
            stage: stage.into(),
        }
    }
}

/// A unit of work in the build graph.
///
/// A stage is re-run only when it is marked dirty, has never produced an
/// output, or one of its dependencies produced a different output than last
/// time. Its output must be hashable, because the fingerprint of the output
/// is what tells dependents whether they need to run.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Output: Hash + Send + Sync + 'static;

    /// Unique within the graph.
    fn name(&self) -> Cow<'static, str>;

    /// Glob patterns of source paths this stage reads.
    fn watched(&self) -> Vec<String> {
        vec![]
    }

    async fn run(&self, cx: &StageContext, inputs: &Inputs) -> Result<Self::Output, StageError>;
}

/// The object-safe face of [`Stage`] the scheduler works with.
#[async_trait]
pub(crate) trait ErasedStage: Send + Sync {
    fn output_type_name(&self) -> &'static str;

    async fn run(&self, cx: &StageContext, inputs: &Inputs) -> Result<(Dynamic, Hash32), StageError>;
}

#[async_trait]
impl<S> ErasedStage for S
where
    S: Stage,
{
    fn output_type_name(&self) -> &'static str {
        type_name::<S::Output>()
    }

    async fn run(&self, cx: &StageContext, inputs: &Inputs) -> Result<(Dynamic, Hash32), StageError> {
        let output = Stage::run(self, cx, inputs).await?;
        let fingerprint = Hash32::of(&output);
        Ok((Arc::new(output), fingerprint))
    }
}

/// A type-safe reference to a stage in the build graph.
///
/// `Handle<T>` is a copyable token standing for the future output `T` of a
/// stage. Passing it as a dependency orders the graph; passing it to
/// [`Inputs::get`] reads the output at run time.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle<T> {
    index: NodeIndex,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: NodeIndex) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying `NodeIndex` of the stage in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

/// A collection of [`Handle`]s usable as the dependencies of a stage.
///
/// Implemented for `()`, single handles, vectors of handles and tuples of up
/// to eight handles.
pub trait Dependencies {
    fn dependencies(&self) -> Vec<NodeIndex>;
}

impl Dependencies for () {
    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![]
    }
}

impl<T> Dependencies for Handle<T> {
    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![self.index]
    }
}

impl<T> Dependencies for Vec<Handle<T>> {
    fn dependencies(&self) -> Vec<NodeIndex> {
        self.iter().map(Handle::index).collect()
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($(Handle<$D>,)*) {
            fn dependencies(&self) -> Vec<NodeIndex> {
                let ($($D,)*) = self;
                vec![$($D.index(),)*]
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);

/// The outputs of a stage's dependencies.
#[derive(Default)]
pub struct Inputs {
    stage: String,
    outputs: HashMap<NodeIndex, Dynamic>,
}

impl Inputs {
    pub(crate) fn new(stage: &str, outputs: HashMap<NodeIndex, Dynamic>) -> Self {
        Self {
            stage: stage.to_owned(),
            outputs,
        }
    }

    /// Inputs of a stage with no dependencies.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Borrows the output of a dependency.
    pub fn get<T: 'static>(&self, handle: Handle<T>) -> Result<&T, StageError> {
        self.outputs
            .get(&handle.index())
            .and_then(|output| output.downcast_ref::<T>())
            .ok_or_else(|| self.mismatch())
    }

    /// Shares the output of a dependency, for moving into spawned work.
    pub fn get_shared<T: Send + Sync + 'static>(
        &self,
        handle: Handle<T>,
    ) -> Result<Arc<T>, StageError> {
        self.outputs
            .get(&handle.index())
            .cloned()
            .and_then(|output| output.downcast::<T>().ok())
            .ok_or_else(|| self.mismatch())
    }

    fn mismatch(&self) -> StageError {
        StageError::Input {
            stage: self.stage.clone(),
        }
    }
}

/// A stage defined by a plain closure over its inputs.
pub struct FnStage<F> {
    name: Cow<'static, str>,
    watched: Vec<String>,
    callback: F,
}

impl<F, R> FnStage<F>
where
    F: Fn(&StageContext, &Inputs) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<Cow<'static, str>>, callback: F) -> Self {
        Self {
            name: name.into(),
            watched: vec![],
            callback,
        }
    }

    /// Marks the stage dirty whenever a path matching `glob` changes.
    pub fn watch(mut self, glob: impl Into<String>) -> Self {
        self.watched.push(glob.into());
        self
    }
}

#[async_trait]
impl<F, R> Stage for FnStage<F>
where
    F: Fn(&StageContext, &Inputs) -> anyhow::Result<R> + Send + Sync + 'static,
    R: Hash + Send + Sync + 'static,
{
    type Output = R;

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn watched(&self) -> Vec<String> {
        self.watched.clone()
    }

    async fn run(&self, cx: &StageContext, inputs: &Inputs) -> Result<R, StageError> {
        Ok((self.callback)(cx, inputs)?)
    }
}

/// Compiled watch patterns of one stage.
pub(crate) struct Watched(Vec<glob::Pattern>);

impl Watched {
    pub(crate) fn compile(stage: &str, globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| match glob::Pattern::new(glob) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(stage, glob, "ignoring invalid watch pattern: {e}");
                    None
                }
            })
            .collect();

        Self(patterns)
    }

    pub(crate) fn matches(&self, path: &Utf8Path) -> bool {
        self.0.iter().any(|pattern| pattern.matches(path.as_str()))
    }
}
