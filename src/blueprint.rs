use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use camino::Utf8Path;
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::core::Environment;
use crate::engine::runner::{self, BuildReport, Node, Record};
use crate::engine::{Dependencies, FnStage, Handle, Inputs, Stage, StageContext, Watched};
use crate::error::BuildError;

/// The blueprint of a build.
///
/// `Blueprint` is used to define the stage graph. You add stages and wire
/// them together using the [`Handle`]s returned for earlier stages.
///
/// Once configured, [`finish`](Blueprint::finish) turns it into a
/// [`Pipeline`] that executes builds.
///
/// # Example
///
/// ```rust,no_run
/// use stagehand::{Blueprint, Config};
///
/// # async fn demo() -> anyhow::Result<()> {
/// let mut blueprint = Blueprint::new();
/// let version = blueprint.add_fn("version", (), |_, _| Ok(3u32));
/// blueprint.add_fn("banner", version, move |_, inputs| {
///     Ok(format!("v{}", inputs.get(version)?))
/// });
///
/// let mut pipeline = blueprint.finish(Config::default())?;
/// pipeline.build().await?.into_result()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Blueprint {
    graph: Graph<Node, ()>,
    names: HashSet<String>,
    duplicate: Option<String>,
}

impl Blueprint {
    /// Creates a new, empty blueprint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage running after everything in `dependencies`.
    pub fn add_stage<S, D>(&mut self, stage: S, dependencies: D) -> Handle<S::Output>
    where
        S: Stage,
        D: Dependencies,
    {
        let name = stage.name().to_string();
        if !self.names.insert(name.clone()) && self.duplicate.is_none() {
            self.duplicate = Some(name.clone());
        }

        let watched = Watched::compile(&name, &stage.watched());
        let index = self.graph.add_node(Node {
            name: name.into(),
            stage: Arc::new(stage),
            watched,
        });

        for dependency in dependencies.dependencies() {
            self.graph.add_edge(dependency, index, ());
        }

        Handle::new(index)
    }

    /// Adds a stage defined by a closure.
    pub fn add_fn<D, F, R>(&mut self, name: &'static str, dependencies: D, callback: F) -> Handle<R>
    where
        D: Dependencies,
        F: Fn(&StageContext, &Inputs) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Hash + Send + Sync + 'static,
    {
        self.add_stage(FnStage::new(name, callback), dependencies)
    }

    /// Validates the graph and opens the cache store named by `config`.
    pub fn finish(self, config: Config) -> Result<Pipeline, BuildError> {
        if let Some(stage) = self.duplicate {
            return Err(BuildError::DuplicateStage { stage });
        }

        petgraph::algo::toposort(&self.graph, None).map_err(|cycle| BuildError::Cycle {
            stage: self.graph[cycle.node_id()].name.to_string(),
        })?;

        let cache = match &config.state_file {
            Some(path) => CacheStore::load(path)?,
            None => CacheStore::in_memory(),
        };

        Ok(Pipeline {
            graph: self.graph,
            records: HashMap::new(),
            dirty: HashSet::new(),
            env: Arc::new(Environment::new(config)),
            cache: Arc::new(cache),
        })
    }
}

impl std::fmt::Display for Blueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render_mermaid(&self.graph, f)
    }
}

/// A finished stage graph, ready to be built any number of times.
///
/// Stage outputs are kept between builds, so a stage runs again only when it
/// was marked dirty or something upstream of it changed. Instance records in
/// the cache store are persisted after each build, which lets a new process
/// pick up where the last one left off.
pub struct Pipeline {
    graph: Graph<Node, ()>,
    records: HashMap<NodeIndex, Record>,
    dirty: HashSet<NodeIndex>,
    env: Arc<Environment>,
    cache: Arc<CacheStore>,
}

impl Pipeline {
    /// Runs one build.
    ///
    /// Stage failures do not make this return an error, they are part of the
    /// report; use [`BuildReport::into_result`] to fail on them. Errors here
    /// are about persisting the cache store.
    pub async fn build(&mut self) -> Result<BuildReport, BuildError> {
        tracing::info!(build = %self.env.build, stages = self.graph.node_count(), "starting build");

        let report = runner::run(
            &self.graph,
            &mut self.records,
            &self.dirty,
            &self.env,
            &self.cache,
        )
        .await;

        self.dirty.clear();
        self.cache.save()?;

        Ok(report)
    }

    /// Forces a stage to run in the next build.
    pub fn mark_dirty<T>(&mut self, handle: Handle<T>) {
        self.dirty.insert(handle.index());
    }

    /// Marks every stage watching one of `paths` as dirty, returning how many
    /// stages were affected.
    pub fn notify_changed<P>(&mut self, paths: impl IntoIterator<Item = P>) -> usize
    where
        P: AsRef<Utf8Path>,
    {
        let paths: Vec<P> = paths.into_iter().collect();
        let mut marked = 0;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            if paths.iter().any(|path| node.watched.matches(path.as_ref())) {
                tracing::debug!(stage = &*node.name, "marked dirty");
                self.dirty.insert(index);
                marked += 1;
            }
        }

        marked
    }

    /// The output a stage produced in its last successful build.
    pub fn output<T: Send + Sync + 'static>(&self, handle: Handle<T>) -> Option<Arc<T>> {
        self.records
            .get(&handle.index())
            .and_then(|record| record.output.clone().downcast::<T>().ok())
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render_mermaid(&self.graph, f)
    }
}

fn render_mermaid(graph: &Graph<Node, ()>, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "graph LR")?;

    for index in graph.node_indices() {
        let name = graph[index].name.replace('"', "\\\""); // Simple escape
        writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
    }

    for edge in graph.raw_edges() {
        let type_name = graph[edge.source()]
            .stage
            .output_type_name()
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        writeln!(
            f,
            "    {:?} -- \"{}\" --> {:?}",
            edge.source().index(),
            type_name,
            edge.target().index()
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::engine::diff::Instance;
    use crate::engine::instanced::{InstancedStage, Lifecycle};
    use crate::engine::runner::StageStatus;

    fn config() -> Config {
        Config::default().state_file(None)
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test]
    async fn test_diamond_runs_once_then_caches() {
        let runs = counter();
        let value = Arc::new(AtomicU32::new(1));

        let mut blueprint = Blueprint::new();
        let a = {
            let (runs, value) = (runs.clone(), value.clone());
            blueprint.add_fn("a", (), move |_, _| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(value.load(Ordering::SeqCst))
            })
        };
        let b = blueprint.add_fn("b", a, move |_, i| Ok(*i.get(a)? + 1));
        let c = blueprint.add_fn("c", a, move |_, i| Ok(*i.get(a)? * 10));
        let d = blueprint.add_fn("d", (b, c), move |_, i| Ok(*i.get(b)? + *i.get(c)?));

        let mut pipeline = blueprint.finish(config()).unwrap();

        let report = pipeline.build().await.unwrap();
        assert_eq!(report.executed(), vec!["a", "b", "c", "d"]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*pipeline.output(d).unwrap(), 12);

        let report = pipeline.build().await.unwrap();
        assert!(report.executed().is_empty());
        assert!(report.is_success());

        // Same output, so nothing downstream is invalidated.
        pipeline.mark_dirty(a);
        let report = pipeline.build().await.unwrap();
        assert_eq!(report.executed(), vec!["a"]);
        assert!(matches!(
            report.status("a"),
            Some(StageStatus::Executed { changed: false, .. })
        ));

        value.store(2, Ordering::SeqCst);
        pipeline.mark_dirty(a);
        let report = pipeline.build().await.unwrap();
        assert_eq!(report.executed(), vec!["a", "b", "c", "d"]);
        assert_eq!(*pipeline.output(d).unwrap(), 23);
    }

    #[tokio::test]
    async fn test_failure_skips_only_dependents() {
        let broken = Arc::new(AtomicU32::new(1));

        let mut blueprint = Blueprint::new();
        let x = {
            let broken = broken.clone();
            blueprint.add_fn("x", (), move |_, _| {
                if broken.load(Ordering::SeqCst) == 1 {
                    anyhow::bail!("The file contains no root element.");
                }
                Ok(1u8)
            })
        };
        blueprint.add_fn("y", x, move |_, i| Ok(*i.get(x)?));
        blueprint.add_fn("z", (), |_, _| Ok("independent"));

        let mut pipeline = blueprint.finish(config()).unwrap();
        let report = pipeline.build().await.unwrap();

        assert!(matches!(report.status("x"), Some(StageStatus::Failed(_))));
        assert!(matches!(report.status("y"), Some(StageStatus::Skipped { cause }) if cause == "x"));
        assert!(matches!(report.status("z"), Some(StageStatus::Executed { .. })));
        assert!(matches!(
            report.into_result(),
            Err(BuildError::Failed { stages }) if stages == vec!["x", "y"]
        ));

        broken.store(0, Ordering::SeqCst);
        let report = pipeline.build().await.unwrap();
        assert_eq!(report.executed(), vec!["x", "y"]);
        assert!(matches!(report.status("z"), Some(StageStatus::Cached)));
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let mut blueprint = Blueprint::new();
        blueprint.add_fn("boom", (), |_, _| -> anyhow::Result<u8> { panic!("kaboom") });

        let mut pipeline = blueprint.finish(config()).unwrap();
        let report = pipeline.build().await.unwrap();

        match report.status("boom") {
            Some(StageStatus::Failed(error)) => {
                assert!(matches!(&**error, crate::StageError::Panicked(msg) if msg == "kaboom"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notify_changed_matches_watched_globs() {
        let runs = counter();

        let mut blueprint = Blueprint::new();
        {
            let runs = runs.clone();
            blueprint.add_stage(
                FnStage::new("sprites", move |_, _| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .watch("src/*/sprites/*.svg"),
                (),
            );
        }

        let mut pipeline = blueprint.finish(config()).unwrap();
        pipeline.build().await.unwrap();

        assert_eq!(pipeline.notify_changed(["src/pong/sounds/hit.wav"]), 0);
        pipeline.build().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(pipeline.notify_changed(["src/pong/sprites/ball.svg"]), 1);
        pipeline.build().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut blueprint = Blueprint::new();
        blueprint.add_fn("same", (), |_, _| Ok(1u8));
        blueprint.add_fn("same", (), |_, _| Ok(2u8));

        assert!(matches!(
            blueprint.finish(config()),
            Err(BuildError::DuplicateStage { stage }) if stage == "same"
        ));
    }

    #[test]
    fn test_mermaid() {
        let mut blueprint = Blueprint::new();
        let a = blueprint.add_fn("a", (), |_, _| Ok(1u8));
        blueprint.add_fn("b", a, |_, _| Ok(2u8));

        let rendered = blueprint.to_string();
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("0 -- \"u8\" --> 1"));
    }

    struct Counting(Arc<AtomicU32>);

    #[async_trait::async_trait]
    impl Lifecycle<u32> for Counting {
        type Output = u32;

        async fn created(&self, _: &StageContext, _: &str, content: &u32) -> anyhow::Result<u32> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(*content)
        }

        async fn deleted(&self, _: &StageContext, _: &str, _: &u32) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fresh_process_resumes_from_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = Utf8PathBuf::from_path_buf(dir.path().join("state.cbor")).unwrap();
        let calls = counter();

        let pipeline = || {
            let mut blueprint = Blueprint::new();
            blueprint.add_stage(
                InstancedStage::new(
                    "numbers",
                    |_: &StageContext, _: &Inputs| {
                        anyhow::Ok(vec![Instance::new("a", 1u32), Instance::new("b", 2u32)])
                    },
                    Counting(calls.clone()),
                ),
                (),
            );
            blueprint
                .finish(Config::default().state_file(Some(state.clone())))
                .unwrap()
        };

        pipeline().build().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let report = pipeline().build().await.unwrap();
        assert_eq!(report.executed(), vec!["numbers"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
