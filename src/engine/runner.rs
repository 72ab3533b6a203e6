use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::Style;
use indicatif::ProgressStyle;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, Level};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::CacheStore;
use crate::core::{ArcStr, Dynamic, Environment, Hash32};
use crate::engine::{ErasedStage, Inputs, StageContext, Watched};
use crate::error::{BuildError, StageError};

const ANSI_BLUE: Style = Style::new().blue();

/// A stage as stored in the graph.
pub(crate) struct Node {
    pub name: ArcStr,
    pub stage: Arc<dyn ErasedStage>,
    pub watched: Watched,
}

/// The last successful output of a stage.
#[derive(Clone)]
pub(crate) struct Record {
    pub output: Dynamic,
    pub fingerprint: Hash32,
}

/// What happened to one stage during a build.
#[derive(Debug, Clone)]
pub enum StageStatus {
    /// The stage ran. `changed` is false when it reproduced its previous
    /// output, in which case dependents were not invalidated by it.
    Executed { duration: Duration, changed: bool },
    /// Nothing the stage depends on changed, its previous output was reused.
    Cached,
    /// The stage ran and failed.
    Failed(Arc<StageError>),
    /// The stage was not run because `cause` failed upstream.
    Skipped { cause: String },
}

impl StageStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, StageStatus::Executed { .. } | StageStatus::Cached)
    }
}

/// Per-stage outcome of one build, in the order stages were added.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub stages: Vec<(String, StageStatus)>,
    pub duration: Duration,
}

impl BuildReport {
    pub fn status(&self, stage: &str) -> Option<&StageStatus> {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, status)| status)
    }

    pub fn is_success(&self) -> bool {
        self.stages.iter().all(|(_, status)| status.is_ok())
    }

    /// Stages that failed themselves, not counting skipped dependents.
    pub fn failures(&self) -> Vec<(&str, &StageError)> {
        self.stages
            .iter()
            .filter_map(|(name, status)| match status {
                StageStatus::Failed(error) => Some((name.as_str(), error.as_ref())),
                _ => None,
            })
            .collect()
    }

    /// Names of the stages that actually ran.
    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|(_, status)| matches!(status, StageStatus::Executed { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Turns a report with failed or skipped stages into an error.
    pub fn into_result(self) -> Result<Self, BuildError> {
        if self.is_success() {
            return Ok(self);
        }

        let stages = self
            .stages
            .iter()
            .filter(|(_, status)| !status.is_ok())
            .map(|(name, _)| name.clone())
            .collect();

        Err(BuildError::Failed { stages })
    }
}

fn as_overhead(elapsed: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", elapsed.as_millis()))
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }

    let panic = error.into_panic();
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

type Finished = (NodeIndex, Result<(Dynamic, Hash32), StageError>, Duration);

/// Executes the stage graph.
///
/// Stages are started as soon as all of their dependencies have completed, so
/// independent branches run concurrently. A stage runs when it is explicitly
/// dirty, has no record from an earlier build, or depends on a stage whose
/// output changed during this build; otherwise its record is reused.
///
/// A failed stage loses its record and every stage downstream of it is
/// skipped and loses its record too, so the next build retries all of them.
/// Unrelated stages are unaffected.
pub(crate) async fn run(
    graph: &Graph<Node, ()>,
    records: &mut HashMap<NodeIndex, Record>,
    dirty: &HashSet<NodeIndex>,
    env: &Arc<Environment>,
    cache: &Arc<CacheStore>,
) -> BuildReport {
    let start = Instant::now();

    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    let mut dependency_counts: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|i| {
            let count = graph
                .neighbors_directed(i, petgraph::Direction::Incoming)
                .count();
            (i, count)
        })
        .collect();

    let mut ready: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|i| dependency_counts[i] == 0)
        .collect();

    let total = graph.node_count();
    let root_span = tracing::span!(Level::INFO, "building_stages");
    root_span.pb_set_length(total as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        root_span.pb_set_style(&style.progress_chars("=>-"));
    }
    root_span.pb_set_message("Building stages...");

    let mut statuses: HashMap<NodeIndex, StageStatus> = HashMap::new();
    let mut changed: HashSet<NodeIndex> = HashSet::new();
    let mut blocked: HashMap<NodeIndex, String> = HashMap::new();
    let mut running: JoinSet<Finished> = JoinSet::new();

    while statuses.len() < total {
        while let Some(index) = ready.pop_front() {
            let node = &graph[index];

            if let Some(cause) = blocked.get(&index) {
                tracing::warn!(stage = &*node.name, cause = cause.as_str(), "skipped");
                records.remove(&index);
                statuses.insert(index, StageStatus::Skipped { cause: cause.clone() });
                complete(index, &dependents, &mut dependency_counts, &mut ready);
                root_span.pb_inc(1);
                continue;
            }

            let upstream: Vec<NodeIndex> = graph
                .neighbors_directed(index, petgraph::Direction::Incoming)
                .collect();

            let must_run = dirty.contains(&index)
                || !records.contains_key(&index)
                || upstream.iter().any(|dep| changed.contains(dep));

            if !must_run {
                tracing::debug!(stage = &*node.name, "cached");
                statuses.insert(index, StageStatus::Cached);
                complete(index, &dependents, &mut dependency_counts, &mut ready);
                root_span.pb_inc(1);
                continue;
            }

            let outputs = upstream
                .iter()
                .filter_map(|dep| records.get(dep).map(|r| (*dep, r.output.clone())))
                .collect();

            let inputs = Inputs::new(&node.name, outputs);
            let cx = StageContext::new(env.clone(), cache.clone(), &node.name);
            let stage = node.stage.clone();
            let span = tracing::info_span!(parent: &root_span, "stage", name = &*node.name);

            running.spawn(
                async move {
                    let start = Instant::now();

                    // Run on its own task so a panic surfaces as a JoinError
                    // instead of tearing down the scheduler.
                    let task = tokio::spawn(
                        async move { stage.run(&cx, &inputs).await }.in_current_span(),
                    );

                    let result = match task.await {
                        Ok(result) => result,
                        Err(e) => Err(StageError::Panicked(panic_message(e))),
                    };

                    (index, result, start.elapsed())
                }
                .instrument(span),
            );
        }

        let Some(joined) = running.join_next().await else {
            break;
        };

        let (index, result, duration) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                tracing::error!("stage driver failed: {e}");
                continue;
            }
        };

        let name = &graph[index].name;
        match result {
            Ok((output, fingerprint)) => {
                let is_changed = records
                    .get(&index)
                    .is_none_or(|record| record.fingerprint != fingerprint);

                if is_changed {
                    changed.insert(index);
                }

                tracing::info!(
                    stage = &**name,
                    changed = is_changed,
                    "finished {}",
                    as_overhead(duration)
                );
                records.insert(index, Record { output, fingerprint });
                statuses.insert(
                    index,
                    StageStatus::Executed {
                        duration,
                        changed: is_changed,
                    },
                );
            }
            Err(error) => {
                tracing::error!(stage = &**name, "failed: {error}");
                records.remove(&index);
                block_downstream(index, name, &dependents, &mut blocked);
                statuses.insert(index, StageStatus::Failed(Arc::new(error)));
            }
        }

        complete(index, &dependents, &mut dependency_counts, &mut ready);
        root_span.pb_inc(1);
    }

    let stages = graph
        .node_indices()
        .filter_map(|i| {
            let status = statuses.remove(&i)?;
            Some((graph[i].name.to_string(), status))
        })
        .collect();

    let report = BuildReport {
        stages,
        duration: start.elapsed(),
    };

    if report.is_success() {
        tracing::info!("Build complete {}", as_overhead(report.duration));
    } else {
        tracing::error!(
            failed = report.failures().len(),
            "Build finished with errors {}",
            as_overhead(report.duration)
        );
    }

    report
}

fn complete(
    index: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    dependency_counts: &mut HashMap<NodeIndex, usize>,
    ready: &mut VecDeque<NodeIndex>,
) {
    for &next in dependents.get(&index).into_iter().flatten() {
        if let Some(count) = dependency_counts.get_mut(&next) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(next);
            }
        }
    }
}

fn block_downstream(
    failed: NodeIndex,
    cause: &str,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    blocked: &mut HashMap<NodeIndex, String>,
) {
    let mut stack = vec![failed];

    while let Some(index) = stack.pop() {
        for &next in dependents.get(&index).into_iter().flatten() {
            if !blocked.contains_key(&next) {
                blocked.insert(next, cause.to_owned());
                stack.push(next);
            }
        }
    }
}
