//! Stages that manage a dynamic, keyed population of instances.
//!
//! An [`InstancedStage`] asks its source for the complete current set of
//! instances, diffs their fingerprints against what the [`CacheStore`]
//! recorded for the last build and then drives a [`Lifecycle`]
//! with the result:
//!
//! 1. every deleted key is torn down first, so that anything relocated into
//!    its place cannot collide with a stale artifact;
//! 2. created and updated keys are processed next, in key order;
//! 3. unchanged keys reuse their cached output without any work.
//!
//! Instance operations of one batch are started concurrently, bounded by
//! [`Config::concurrency`](crate::Config), and joined in submission order so
//! that logs and counters do not depend on completion order. A failing
//! instance never aborts its siblings, the failures are collected and
//! reported together once the batch is done.
//!
//! A failure is remembered in the cache. The instance is retried on the next
//! build even if its content did not change. If it disappears instead, it is
//! torn down with whatever output is known, or [discarded] when none is.
//!
//! [`CacheStore`]: crate::CacheStore
//! [discarded]: Lifecycle::discarded

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::cache::CacheEntry;
use crate::core::Hash32;
use crate::engine::diff::{ChangeSet, Instance};
use crate::engine::{Inputs, Stage, StageContext};
use crate::error::{InstanceFailure, StageError};

/// What happens to an instance when it appears, changes or disappears.
#[async_trait]
pub trait Lifecycle<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Recorded in the cache for every processed instance and handed back
    /// when the instance is updated or deleted.
    type Output: Clone + Hash + Serialize + DeserializeOwned + Send + Sync + 'static;

    async fn created(&self, cx: &StageContext, key: &str, content: &T)
    -> anyhow::Result<Self::Output>;

    /// Defaults to [`deleted`](Lifecycle::deleted) followed by
    /// [`created`](Lifecycle::created).
    async fn updated(
        &self,
        cx: &StageContext,
        key: &str,
        previous: &Self::Output,
        content: &T,
    ) -> anyhow::Result<Self::Output> {
        self.deleted(cx, key, previous).await?;
        self.created(cx, key, content).await
    }

    async fn deleted(&self, cx: &StageContext, key: &str, previous: &Self::Output)
    -> anyhow::Result<()>;

    /// Tears down an instance known only by its key, because the operation
    /// that would have produced its output failed. Anything it may have left
    /// behind has to be found from the key alone.
    async fn discarded(&self, _cx: &StageContext, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Creates an instance again after a failure left no output behind.
    /// Defaults to [`discarded`](Lifecycle::discarded) followed by
    /// [`created`](Lifecycle::created).
    async fn recreated(
        &self,
        cx: &StageContext,
        key: &str,
        content: &T,
    ) -> anyhow::Result<Self::Output> {
        self.discarded(cx, key).await?;
        self.created(cx, key, content).await
    }
}

/// Produces the complete instance set of a stage for the current build.
#[async_trait]
pub trait InstanceSource<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn instances(
        &self,
        cx: &StageContext,
        inputs: &Inputs,
    ) -> anyhow::Result<Vec<Instance<T>>>;
}

#[async_trait]
impl<T, F> InstanceSource<T> for F
where
    T: Send + 'static,
    F: Fn(&StageContext, &Inputs) -> anyhow::Result<Vec<Instance<T>>> + Send + Sync + 'static,
{
    async fn instances(
        &self,
        cx: &StageContext,
        inputs: &Inputs,
    ) -> anyhow::Result<Vec<Instance<T>>> {
        self(cx, inputs)
    }
}

/// Keys of a stage's instances, grouped by what happened to them this build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ChangeSummary {
    /// Keys that were created or updated.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// The output of an instanced stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancedOutput<O> {
    /// Lifecycle output of every current instance.
    pub items: BTreeMap<String, O>,
    /// What changed in the build that produced this output.
    pub changes: ChangeSummary,
}

impl<O> InstancedOutput<O> {
    pub fn get(&self, key: &str) -> Option<&O> {
        self.items.get(key)
    }
}

// Only the items count: a rebuild that ends in the same state must not look
// like a change to dependents.
impl<O: Hash> Hash for InstancedOutput<O> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.items.hash(state);
    }
}

/// A stage whose output is a managed population of instances.
pub struct InstancedStage<T, L, S> {
    name: Cow<'static, str>,
    watched: Vec<String>,
    source: S,
    lifecycle: Arc<L>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, L, S> InstancedStage<T, L, S>
where
    T: Hash + Send + Sync + 'static,
    L: Lifecycle<T>,
    S: InstanceSource<T>,
{
    pub fn new(name: impl Into<Cow<'static, str>>, source: S, lifecycle: L) -> Self {
        Self {
            name: name.into(),
            watched: vec![],
            source,
            lifecycle: Arc::new(lifecycle),
            _phantom: PhantomData,
        }
    }

    /// Marks the stage dirty whenever a path matching `glob` changes.
    pub fn watch(mut self, glob: impl Into<String>) -> Self {
        self.watched.push(glob.into());
        self
    }

    pub fn lifecycle(&self) -> &Arc<L> {
        &self.lifecycle
    }
}

#[async_trait]
impl<T, L, S> Stage for InstancedStage<T, L, S>
where
    T: Hash + Send + Sync + 'static,
    L: Lifecycle<T>,
    S: InstanceSource<T>,
{
    type Output = InstancedOutput<L::Output>;

    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn watched(&self) -> Vec<String> {
        self.watched.clone()
    }

    async fn run(&self, cx: &StageContext, inputs: &Inputs) -> Result<Self::Output, StageError> {
        let instances = self.source.instances(cx, inputs).await?;
        reconcile(cx, &self.lifecycle, instances).await
    }
}

enum Op<T, O> {
    Create { content: T },
    Update { previous: O, content: T },
    /// Creation after a failure that left no output.
    Recreate { content: T },
    Delete { previous: O },
    /// Deletion after a failure that left no output.
    Discard,
}

impl<T, O> Op<T, O>
where
    T: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    fn verb(&self) -> &'static str {
        match self {
            Op::Create { .. } | Op::Recreate { .. } => "created",
            Op::Update { .. } => "updated",
            Op::Delete { .. } | Op::Discard => "deleted",
        }
    }

    async fn apply<L>(self, lifecycle: &L, cx: &StageContext, key: &str) -> anyhow::Result<Option<O>>
    where
        L: Lifecycle<T, Output = O>,
    {
        match self {
            Op::Create { content } => lifecycle.created(cx, key, &content).await.map(Some),
            Op::Update { previous, content } => lifecycle
                .updated(cx, key, &previous, &content)
                .await
                .map(Some),
            Op::Recreate { content } => lifecycle.recreated(cx, key, &content).await.map(Some),
            Op::Delete { previous } => lifecycle.deleted(cx, key, &previous).await.map(|()| None),
            Op::Discard => lifecycle.discarded(cx, key).await.map(|()| None),
        }
    }
}

struct Job<T, O> {
    key: String,
    fingerprint: Hash32,
    op: Op<T, O>,
}

struct Done<O> {
    key: String,
    verb: &'static str,
    fingerprint: Hash32,
    result: anyhow::Result<Option<O>>,
}

/// Brings the instances recorded under `cx.stage()` in line with `instances`.
pub(crate) async fn reconcile<T, L>(
    cx: &StageContext,
    lifecycle: &Arc<L>,
    instances: Vec<Instance<T>>,
) -> Result<InstancedOutput<L::Output>, StageError>
where
    T: Hash + Send + Sync + 'static,
    L: Lifecycle<T>,
{
    let stage = cx.stage().to_owned();

    let mut curr = BTreeMap::new();
    let mut contents = HashMap::new();
    for Instance { key, content } in instances {
        curr.insert(key.clone(), Hash32::of(&content));
        if contents.insert(key.clone(), content).is_some() {
            return Err(StageError::KeyCollision { key });
        }
    }

    let mut prev = BTreeMap::new();
    let mut outputs = HashMap::new();
    let mut failed = HashSet::new();
    for (key, entry) in cx.cache.entries(&stage) {
        prev.insert(key.clone(), entry.fingerprint);

        let output = entry
            .output
            .map(serde_json::from_value::<L::Output>)
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!(
                    stage = stage.as_str(),
                    key = key.as_str(),
                    "ignoring unreadable cache output: {e}"
                );
                None
            });

        match output {
            Some(output) => {
                outputs.insert(key.clone(), output);
                if entry.failed {
                    failed.insert(key);
                }
            }
            None => {
                failed.insert(key);
            }
        }
    }

    let mut changes = ChangeSet::diff(&prev, &curr);

    // Failed instances are never up to date, whatever their fingerprint says.
    let (retried, unchanged): (Vec<_>, Vec<_>) = changes
        .unchanged
        .into_iter()
        .partition(|instance| failed.contains(&instance.key));
    changes.unchanged = unchanged;
    changes
        .updated
        .extend(retried.into_iter().map(|instance| (instance.clone(), instance)));

    let total = curr.len() + changes.deleted.len();

    if !changes.is_empty() {
        tracing::info!(
            stage = stage.as_str(),
            created = changes.created.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            unchanged = changes.unchanged.len(),
            "reconciling instances"
        );
    }

    let limit = Arc::new(Semaphore::new(cx.config().concurrency.max(1)));
    let mut summary = ChangeSummary::default();
    let mut items = BTreeMap::new();
    let mut failures = Vec::new();

    let deletions = changes
        .deleted
        .into_iter()
        .map(|Instance { key, content: fingerprint }| {
            let op = match outputs.remove(&key) {
                Some(previous) => Op::Delete { previous },
                None => Op::Discard,
            };
            Job {
                key,
                fingerprint,
                op,
            }
        })
        .collect();

    for done in run_batch(cx, lifecycle, &limit, deletions).await {
        match done.result {
            Ok(_) => {
                cx.cache.delete(&stage, &done.key);
                summary.deleted.push(done.key);
            }
            // The entry stays, so the next build retries the deletion.
            Err(error) => {
                let known = cx.cache.get(&stage, &done.key).and_then(|entry| entry.output);
                cx.cache
                    .put(&stage, &done.key, CacheEntry::failure(done.fingerprint, known));
                failures.push(InstanceFailure {
                    key: done.key,
                    error,
                });
            }
        }
    }

    let mut jobs = Vec::with_capacity(changes.created.len() + changes.updated.len());
    for Instance { key, content } in changes.created {
        if let Some(item) = contents.remove(&key) {
            jobs.push(Job {
                key,
                fingerprint: content,
                op: Op::Create { content: item },
            });
        }
    }
    for (_, Instance { key, content }) in changes.updated {
        let Some(item) = contents.remove(&key) else {
            continue;
        };
        let op = match outputs.remove(&key) {
            Some(previous) => Op::Update {
                previous,
                content: item,
            },
            None => Op::Recreate { content: item },
        };
        jobs.push(Job {
            key,
            fingerprint: content,
            op,
        });
    }
    jobs.sort_by(|a, b| a.key.cmp(&b.key));

    for done in run_batch(cx, lifecycle, &limit, jobs).await {
        let Done {
            key,
            verb,
            fingerprint,
            result,
        } = done;

        let recorded = result.and_then(|output| {
            let output = output.ok_or_else(|| anyhow::anyhow!("lifecycle produced no output"))?;
            let value = serde_json::to_value(&output)?;
            Ok((output, value))
        });

        match recorded {
            Ok((output, value)) => {
                cx.cache.put(&stage, &key, CacheEntry::succeeded(fingerprint, value));
                items.insert(key.clone(), output);
                if verb == "created" {
                    summary.created.push(key);
                } else {
                    summary.updated.push(key);
                }
            }
            Err(error) => {
                // The old output may be half gone, but it is still the best
                // lead on what to clean up later.
                let known = cx.cache.get(&stage, &key).and_then(|entry| entry.output);
                cx.cache.put(&stage, &key, CacheEntry::failure(fingerprint, known));
                failures.push(InstanceFailure { key, error });
            }
        }
    }

    for Instance { key, .. } in changes.unchanged {
        if let Some(output) = outputs.remove(&key) {
            items.insert(key.clone(), output);
            summary.unchanged.push(key);
        }
    }

    if !failures.is_empty() {
        return Err(StageError::Instances { failures, total });
    }

    Ok(InstancedOutput {
        items,
        changes: summary,
    })
}

async fn run_batch<T, L>(
    cx: &StageContext,
    lifecycle: &Arc<L>,
    limit: &Arc<Semaphore>,
    jobs: Vec<Job<T, L::Output>>,
) -> Vec<Done<L::Output>>
where
    T: Send + Sync + 'static,
    L: Lifecycle<T>,
{
    let total = jobs.len();
    let mut handles = Vec::with_capacity(total);

    for Job {
        key,
        fingerprint,
        op,
    } in jobs
    {
        let verb = op.verb();
        let span = tracing::info_span!("instance", stage = cx.stage(), key = key.as_str());

        let task = {
            let cx = cx.clone();
            let key = key.clone();
            let lifecycle = lifecycle.clone();
            let limit = limit.clone();

            async move {
                let _permit = limit.acquire_owned().await?;
                op.apply(&*lifecycle, &cx, &key).await
            }
        };

        handles.push((key, verb, fingerprint, tokio::spawn(task.instrument(span))));
    }

    let mut done = Vec::with_capacity(total);

    for (i, (key, verb, fingerprint, handle)) in handles.into_iter().enumerate() {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("instance task failed: {e}")),
        };

        match &result {
            Ok(_) => tracing::info!(stage = cx.stage(), "{verb} {}/{total}: {key}", i + 1),
            Err(e) => tracing::error!(
                stage = cx.stage(),
                key = key.as_str(),
                "failed to be {verb}: {e:#}"
            ),
        }

        done.push(Done {
            key,
            verb,
            fingerprint,
            result,
        });
    }

    done
}

/// A lifecycle owning one child population per instance key.
///
/// The child for a key is built by `factory` the first time the key is seen.
/// Whenever the parent instance is created or updated, `bind` derives the
/// child's complete instance set from the parent's content, and the child
/// reconciles it against its own records, kept under `"{stage}/{key}"`.
/// Deleting the parent instance empties the child and drops it.
pub struct FanOut<T, U, C, B, F> {
    factory: F,
    bind: B,
    children: Mutex<HashMap<String, Arc<C>>>,
    _phantom: PhantomData<fn(T) -> U>,
}

impl<T, U, C, B, F> FanOut<T, U, C, B, F>
where
    F: Fn(&str) -> C,
{
    pub fn new(factory: F, bind: B) -> Self {
        Self {
            factory,
            bind,
            children: Mutex::new(HashMap::new()),
            _phantom: PhantomData,
        }
    }

    fn child(&self, key: &str) -> Arc<C> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new((self.factory)(key)))
            .clone()
    }

    /// Number of children currently alive.
    pub fn len(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn child_context(cx: &StageContext, key: &str) -> StageContext {
    cx.for_stage(&format!("{}/{}", cx.stage(), key))
}

#[async_trait]
impl<T, U, C, B, F> Lifecycle<T> for FanOut<T, U, C, B, F>
where
    T: Send + Sync + 'static,
    U: Hash + Send + Sync + 'static,
    C: Lifecycle<U>,
    B: Fn(&str, &T) -> anyhow::Result<Vec<Instance<U>>> + Send + Sync + 'static,
    F: Fn(&str) -> C + Send + Sync + 'static,
{
    type Output = InstancedOutput<C::Output>;

    async fn created(
        &self,
        cx: &StageContext,
        key: &str,
        content: &T,
    ) -> anyhow::Result<Self::Output> {
        let instances = (self.bind)(key, content)?;
        let child = self.child(key);
        Ok(reconcile(&child_context(cx, key), &child, instances).await?)
    }

    // The child diffs on its own, so an update is just another sync.
    async fn updated(
        &self,
        cx: &StageContext,
        key: &str,
        _: &Self::Output,
        content: &T,
    ) -> anyhow::Result<Self::Output> {
        self.created(cx, key, content).await
    }

    // Same for a retry: the child remembers its own failures.
    async fn recreated(
        &self,
        cx: &StageContext,
        key: &str,
        content: &T,
    ) -> anyhow::Result<Self::Output> {
        self.created(cx, key, content).await
    }

    async fn deleted(&self, cx: &StageContext, key: &str, _: &Self::Output) -> anyhow::Result<()> {
        self.discarded(cx, key).await
    }

    async fn discarded(&self, cx: &StageContext, key: &str) -> anyhow::Result<()> {
        let child = self.child(key);
        reconcile(&child_context(cx, key), &child, Vec::new()).await?;

        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::Config;
    use crate::core::Environment;

    #[derive(Default)]
    struct Recording {
        log: Mutex<Vec<String>>,
    }

    impl Recording {
        fn push(&self, line: String) {
            self.log.lock().unwrap().push(line);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    #[async_trait]
    impl Lifecycle<u32> for Recording {
        type Output = u32;

        async fn created(&self, _: &StageContext, key: &str, content: &u32) -> anyhow::Result<u32> {
            if *content == 0 {
                anyhow::bail!("malformed content");
            }
            self.push(format!("created {key}"));
            Ok(*content)
        }

        async fn updated(
            &self,
            _: &StageContext,
            key: &str,
            previous: &u32,
            content: &u32,
        ) -> anyhow::Result<u32> {
            if *content == 0 {
                anyhow::bail!("malformed content");
            }
            self.push(format!("updated {key} {previous}->{content}"));
            Ok(*content)
        }

        async fn deleted(&self, _: &StageContext, key: &str, _: &u32) -> anyhow::Result<()> {
            self.push(format!("deleted {key}"));
            Ok(())
        }

        async fn discarded(&self, _: &StageContext, key: &str) -> anyhow::Result<()> {
            self.push(format!("discarded {key}"));
            Ok(())
        }
    }

    fn context(stage: &str) -> StageContext {
        let env = Environment::new(Config::default().concurrency(2));
        StageContext::new(Arc::new(env), Arc::new(CacheStore::in_memory()), stage)
    }

    fn set(items: &[(&str, u32)]) -> Vec<Instance<u32>> {
        items.iter().map(|(k, v)| Instance::new(*k, *v)).collect()
    }

    #[tokio::test]
    async fn test_changes_drive_lifecycle() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        reconcile(&cx, &lifecycle, set(&[("a", 1), ("b", 2), ("c", 3)]))
            .await
            .unwrap();
        assert_eq!(lifecycle.take().len(), 3);

        let output = reconcile(&cx, &lifecycle, set(&[("b", 2), ("c", 9), ("d", 4)]))
            .await
            .unwrap();

        let log = lifecycle.take();
        assert_eq!(log[0], "deleted a");
        assert_eq!(log.len(), 3);
        assert!(log.contains(&"updated c 3->9".to_string()));
        assert!(log.contains(&"created d".to_string()));

        assert_eq!(output.changes.created, vec!["d"]);
        assert_eq!(output.changes.updated, vec!["c"]);
        assert_eq!(output.changes.deleted, vec!["a"]);
        assert_eq!(output.changes.unchanged, vec!["b"]);
        assert_eq!(output.items.values().copied().collect::<Vec<_>>(), vec![2, 9, 4]);

        let recorded: Vec<_> = cx.cache.entries("numbers").into_keys().collect();
        assert_eq!(recorded, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_unchanged_build_does_nothing() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        let first = reconcile(&cx, &lifecycle, set(&[("a", 1)])).await.unwrap();
        lifecycle.take();
        let second = reconcile(&cx, &lifecycle, set(&[("a", 1)])).await.unwrap();

        assert!(lifecycle.take().is_empty());
        assert_eq!(Hash32::of(&first), Hash32::of(&second));
        assert!(second.changes.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        let err = reconcile(&cx, &lifecycle, set(&[("a", 1), ("b", 0), ("c", 3)]))
            .await
            .unwrap_err();

        let failures = err.instance_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, "b");
        assert!(!cx.cache.get("numbers", "a").unwrap().failed);
        assert!(!cx.cache.get("numbers", "c").unwrap().failed);

        let broken = cx.cache.get("numbers", "b").unwrap();
        assert!(broken.failed);
        assert_eq!(broken.output, None);

        lifecycle.take();
        let output = reconcile(&cx, &lifecycle, set(&[("a", 1), ("b", 2), ("c", 3)]))
            .await
            .unwrap();
        assert_eq!(lifecycle.take(), vec!["discarded b", "created b"]);
        assert_eq!(output.changes.created, vec!["b"]);
        assert!(!cx.cache.get("numbers", "b").unwrap().failed);
    }

    #[tokio::test]
    async fn test_failed_instance_is_retried_without_changes() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        assert!(reconcile(&cx, &lifecycle, set(&[("a", 0)])).await.is_err());
        lifecycle.take();

        let err = reconcile(&cx, &lifecycle, set(&[("a", 0)])).await.unwrap_err();
        assert_eq!(err.instance_failures()[0].key, "a");
        assert_eq!(lifecycle.take(), vec!["discarded a"]);
    }

    #[tokio::test]
    async fn test_failed_instance_that_disappears_is_discarded() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        assert!(reconcile(&cx, &lifecycle, set(&[("a", 1), ("b", 0)])).await.is_err());
        lifecycle.take();

        let output = reconcile(&cx, &lifecycle, set(&[("a", 1)])).await.unwrap();
        assert_eq!(lifecycle.take(), vec!["discarded b"]);
        assert_eq!(output.changes.deleted, vec!["b"]);
        assert!(cx.cache.get("numbers", "b").is_none());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous_output() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        reconcile(&cx, &lifecycle, set(&[("a", 1)])).await.unwrap();
        assert!(reconcile(&cx, &lifecycle, set(&[("a", 0)])).await.is_err());

        let entry = cx.cache.get("numbers", "a").unwrap();
        assert!(entry.failed);
        assert_eq!(entry.output, Some(serde_json::json!(1)));

        lifecycle.take();
        reconcile(&cx, &lifecycle, set(&[("a", 5)])).await.unwrap();
        assert_eq!(lifecycle.take(), vec!["updated a 1->5"]);

        // Failing again and then disappearing still tears down the old output.
        assert!(reconcile(&cx, &lifecycle, set(&[("a", 0)])).await.is_err());
        lifecycle.take();
        reconcile(&cx, &lifecycle, set(&[])).await.unwrap();
        assert_eq!(lifecycle.take(), vec!["deleted a"]);
        assert!(cx.cache.is_empty());
    }

    /// Finishes `a` only after `b`, to show that results are still reported
    /// in submission order.
    struct Ordered {
        b_done: tokio::sync::Notify,
        finished: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Lifecycle<u32> for Ordered {
        type Output = u32;

        async fn created(&self, _: &StageContext, key: &str, content: &u32) -> anyhow::Result<u32> {
            if key == "a" {
                self.b_done.notified().await;
            }
            self.finished.lock().unwrap().push(key.to_owned());
            if key == "b" {
                self.b_done.notify_one();
            }
            Ok(*content)
        }

        async fn deleted(&self, _: &StageContext, _: &str, _: &u32) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Ordered {
            b_done: tokio::sync::Notify::new(),
            finished: Mutex::new(Vec::new()),
        });

        let output = reconcile(&cx, &lifecycle, set(&[("b", 2), ("a", 1)]))
            .await
            .unwrap();

        assert_eq!(*lifecycle.finished.lock().unwrap(), vec!["b", "a"]);
        assert_eq!(output.changes.created, vec!["a", "b"]);
        assert_eq!(output.items.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_key_collision() {
        let cx = context("numbers");
        let lifecycle = Arc::new(Recording::default());

        let err = reconcile(&cx, &lifecycle, set(&[("a", 1), ("a", 2)]))
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::KeyCollision { key } if key == "a"));
        assert!(lifecycle.take().is_empty());
    }

    #[tokio::test]
    async fn test_stage_runs_source() {
        let cx = context("numbers");
        let stage = InstancedStage::new(
            "numbers",
            |_: &StageContext, _: &Inputs| anyhow::Ok(vec![Instance::new("x", 7u32)]),
            Recording::default(),
        );

        let output = Stage::run(&stage, &cx, &Inputs::empty()).await.unwrap();
        assert_eq!(output.get("x"), Some(&7));
        assert_eq!(stage.lifecycle().take(), vec!["created x"]);
    }

    #[tokio::test]
    async fn test_fan_out_owns_children() {
        let cx = context("levels");
        let fan_out: Arc<FanOut<Vec<u32>, u32, _, _, _>> = Arc::new(FanOut::new(
            |_: &str| Recording::default(),
            |_: &str, tiles: &Vec<u32>| {
                anyhow::Ok(tiles
                    .iter()
                    .enumerate()
                    .map(|(i, tile)| Instance::new(i.to_string(), *tile))
                    .collect())
            },
        ));

        let output = reconcile(&cx, &fan_out, vec![Instance::new("intro", vec![4, 5])])
            .await
            .unwrap();
        assert_eq!(output.items["intro"].items.len(), 2);
        assert_eq!(fan_out.len(), 1);
        assert_eq!(cx.cache.entries("levels/intro").len(), 2);

        let output = reconcile(&cx, &fan_out, vec![Instance::new("intro", vec![4, 6])])
            .await
            .unwrap();
        assert_eq!(output.items["intro"].changes.updated, vec!["1"]);

        reconcile(&cx, &fan_out, Vec::<Instance<Vec<u32>>>::new())
            .await
            .unwrap();
        assert!(fan_out.is_empty());
        assert!(cx.cache.entries("levels/intro").is_empty());
        assert!(cx.cache.entries("levels").is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_cleans_up_after_partial_failure() {
        let cx = context("levels");
        let fan_out: Arc<FanOut<Vec<u32>, u32, _, _, _>> = Arc::new(FanOut::new(
            |_: &str| Recording::default(),
            |_: &str, tiles: &Vec<u32>| {
                anyhow::Ok(tiles
                    .iter()
                    .enumerate()
                    .map(|(i, tile)| Instance::new(i.to_string(), *tile))
                    .collect())
            },
        ));

        let err = reconcile(&cx, &fan_out, vec![Instance::new("intro", vec![4, 0])])
            .await
            .unwrap_err();
        assert_eq!(err.instance_failures()[0].key, "intro");
        assert!(cx.cache.get("levels", "intro").unwrap().failed);
        assert!(!cx.cache.get("levels/intro", "0").unwrap().failed);
        assert!(cx.cache.get("levels/intro", "1").unwrap().failed);
        assert_eq!(fan_out.len(), 1);

        let output = reconcile(&cx, &fan_out, Vec::<Instance<Vec<u32>>>::new())
            .await
            .unwrap();
        assert_eq!(output.changes.deleted, vec!["intro"]);
        assert!(fan_out.is_empty());
        assert!(cx.cache.is_empty());
    }
}
