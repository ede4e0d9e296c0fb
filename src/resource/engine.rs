//! The reconciliation engine (spec §4.1/§5): owns the resource graph,
//! runs autogrouping/autoedge derivation once at build time, then
//! drives every scheduled resource through validate → init → (watch
//! concurrent with serial check-apply) → cleanup as its own tokio
//! task, per "the engine runs each resource's Watch on its own
//! logical thread of control" (§5).
//!
//! Modeled on `turn-server/src/server.rs`'s per-transport task spawn
//! plus `turn-server/src/monitor.rs`'s counter object, adapted from a
//! fixed TURN/UDP worker pool to a dynamic per-resource task set.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::resource::autogroup::{autogroup, Grouping};
use crate::resource::event;
use crate::resource::{Resource, ResourceId, RunningSignal, Services, ShutdownCtx};

const INIT_BACKOFF_START: Duration = Duration::from_millis(200);
const WATCH_BACKOFF_START: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-resource counters, modeled on `turn-server/src/monitor.rs`'s
/// `Counts`.
#[derive(Default)]
struct ResourceCounters {
    check_applies: Count,
    watch_restarts: Count,
    last_check_apply_ok: RwLock<Option<bool>>,
    last_check_apply_err: RwLock<Option<String>>,
}

/// A point-in-time view of one resource's counters, for an operator
/// status endpoint (not wired to HTTP here — out of scope per spec
/// §1's "no general-purpose HTTP server" — but shaped to be dropped
/// behind one).
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub id: String,
    pub check_applies: u64,
    pub watch_restarts: u64,
    pub last_check_apply_ok: Option<bool>,
    pub last_check_apply_err: Option<String>,
}

/// Engine-wide observability, modeled on `turn-server/src/monitor.rs`'s
/// `Monitor` and `turn-server/src/statistics.rs`'s `Counts`: per-resource
/// check-apply counts and the last result, nothing that changes
/// reconciliation semantics.
#[derive(Clone, Default)]
pub struct EngineStats {
    nodes: Arc<RwLock<AHashMap<ResourceId, Arc<ResourceCounters>>>>,
}

impl EngineStats {
    fn register(&self, id: ResourceId) {
        self.nodes.write().entry(id).or_insert_with(|| Arc::new(ResourceCounters::default()));
    }

    fn counters(&self, id: &ResourceId) -> Arc<ResourceCounters> {
        self.nodes.read().get(id).cloned().expect("resource registered before counters are read")
    }

    fn record_check_apply(&self, id: &ResourceId, result: &Result<bool>) {
        let counters = self.counters(id);
        counters.check_applies.inc();
        match result {
            Ok(in_desired_state) => {
                *counters.last_check_apply_ok.write() = Some(*in_desired_state);
                *counters.last_check_apply_err.write() = None;
            }
            Err(e) => {
                *counters.last_check_apply_err.write() = Some(e.to_string());
            }
        }
    }

    fn record_watch_restart(&self, id: &ResourceId) {
        self.counters(id).watch_restarts.inc();
    }

    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        self.nodes
            .read()
            .iter()
            .map(|(id, counters)| ResourceSnapshot {
                id: id.to_string(),
                check_applies: counters.check_applies.get(),
                watch_restarts: counters.watch_restarts.get(),
                last_check_apply_ok: *counters.last_check_apply_ok.read(),
                last_check_apply_err: counters.last_check_apply_err.read().clone(),
            })
            .collect()
    }
}

/// Build-time and run-time knobs that have no bearing on declared
/// resource state (spec §6: "no flag or environment variable is
/// consumed by the core" — these are engine, not resource, settings).
#[derive(Clone)]
pub struct EngineOptions {
    pub debug: bool,
    pub var_dir_root: PathBuf,
    /// Fallback check-apply cadence absent an event, per §5: "the
    /// first checkApply on that resource follows the first event (or
    /// an engine poll)".
    pub poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            debug: false,
            var_dir_root: PathBuf::from("/var/lib/mgmtd"),
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// A handle independent of the running engine, for triggering
/// shutdown and reading stats without holding the (consumed-by-`run`)
/// `Engine` value itself.
#[derive(Clone)]
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    stats: EngineStats,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

pub struct Engine {
    scheduled: Vec<Arc<dyn Resource>>,
    options: EngineOptions,
    stats: EngineStats,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Runs autogrouping (C2) and derives autoedges (C3) over
    /// `resources`, validates every resource that still schedules
    /// independently, and returns an `Engine` ready to `run`, plus a
    /// handle for external shutdown/stats access.
    ///
    /// `ConfigurationInvalid` from any resource's `validate()` aborts
    /// the build — per spec §7, it is "fatal for the node, reported
    /// to the operator, no retry", and there is no partial graph to
    /// run with one resource missing.
    pub fn build(resources: Vec<Arc<dyn Resource>>, options: EngineOptions) -> Result<(Self, EngineHandle)> {
        let (decisions, scheduled) = autogroup(resources);
        for decision in &decisions {
            match decision {
                Grouping::Absorbed { child, parent } => {
                    log::info!("autogroup: {child} absorbed into {parent}");
                }
                Grouping::Refused { child, reason } => {
                    log::warn!("autogroup: {child} not grouped: {reason}");
                }
            }
        }

        for resource in &scheduled {
            resource.validate()?;
        }

        let ids: HashSet<ResourceId> = scheduled.iter().map(|r| r.id()).collect();
        for (from, to) in resolve_autoedges(&ids, &scheduled) {
            log::debug!("autoedge: {from} depends on {to}");
        }

        let (shutdown_tx, _) = watch::channel(false);
        let stats = EngineStats::default();
        for resource in &scheduled {
            stats.register(resource.id());
        }

        let handle = EngineHandle {
            shutdown_tx: shutdown_tx.clone(),
            stats: stats.clone(),
        };
        Ok((
            Self {
                scheduled,
                options,
                stats,
                shutdown_tx,
            },
            handle,
        ))
    }

    /// Drives every scheduled resource to completion. Returns once
    /// shutdown has been requested (via `ctrl-c` or the
    /// `EngineHandle`) and every resource's `watch`/`cleanup` has
    /// returned.
    pub async fn run(self) -> Result<()> {
        let mut tasks = Vec::with_capacity(self.scheduled.len());
        for resource in self.scheduled.iter().cloned() {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let var_dir_root = self.options.var_dir_root.clone();
            let debug = self.options.debug;
            let stats = self.stats.clone();
            let poll_interval = self.options.poll_interval;
            tasks.push(tokio::spawn(run_resource(
                resource,
                shutdown_rx,
                var_dir_root,
                debug,
                stats,
                poll_interval,
            )));
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| Error::watch_failure(format!("ctrl_c: {e}")))?;
                log::info!("engine: shutdown requested (ctrl-c)");
                let _ = self.shutdown_tx.send(true);
            }
            _ = shutdown_rx.changed() => {
                log::info!("engine: shutdown requested");
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }
}

/// Derives ordering edges from every scheduled resource's
/// `autoedges()` iterator (spec §4.3). The actual topological
/// scheduling of a resource graph is out of scope (§1: "the graph
/// builder that wires resources together"); this just resolves and
/// logs the dependency each resource would impose on such a builder.
fn resolve_autoedges(
    ids: &HashSet<ResourceId>,
    resources: &[Arc<dyn Resource>],
) -> Vec<(ResourceId, ResourceId)> {
    let mut edges = Vec::new();
    for resource in resources {
        let Some(mut auto) = resource.autoedges() else { continue };

        while let Some(batch) = auto.next_batch() {
            let results: Vec<bool> = batch.candidates.iter().map(|candidate| ids.contains(candidate)).collect();
            if let Some(hit) = batch.candidates.iter().zip(&results).find(|(_, ok)| **ok) {
                edges.push((resource.id(), hit.0.clone()));
            }
            auto.test(&results);
        }
    }
    edges
}

/// One resource's full lifecycle: retry `init` on transient failure,
/// run `watch` on its own task restarting it with backoff on
/// `WatchFailure`, and drive `check_apply` serially off the event
/// channel with a periodic poll fallback, until shutdown.
async fn run_resource(
    resource: Arc<dyn Resource>,
    shutdown_rx: watch::Receiver<bool>,
    var_dir_root: PathBuf,
    debug: bool,
    stats: EngineStats,
    poll_interval: Duration,
) {
    let id = resource.id();
    stats.register(id.clone());

    let (events_tx, mut events_rx) = event::channel();
    let running = RunningSignal::new();
    let recv = Arc::new(parking_lot::RwLock::new(ahash::AHashMap::new()));

    let make_services = {
        let id = id.clone();
        let shutdown_rx = shutdown_rx.clone();
        let running = running.clone();
        let events_tx = events_tx.clone();
        let var_dir_root = var_dir_root.clone();
        let recv = recv.clone();
        move || {
            Services::new(
                id.clone(),
                debug,
                ShutdownCtx::new(shutdown_rx.clone()),
                running.clone(),
                events_tx.clone(),
                var_dir_root.clone(),
                recv.clone(),
            )
        }
    };

    let mut shutdown_ctx = ShutdownCtx::new(shutdown_rx.clone());
    let mut backoff = INIT_BACKOFF_START;
    loop {
        match resource.init(make_services()).await {
            Ok(()) => break,
            Err(e @ (Error::ConfigurationInvalid(_) | Error::ProgrammerError(_))) => {
                log::error!("{id}: init failed, not retrying: {e}");
                return;
            }
            Err(e) => {
                log::warn!("{id}: init failed, retrying in {backoff:?}: {e}");
                if shutdown_ctx.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_ctx.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    let watch_task = tokio::spawn(run_watch_with_restart(
        resource.clone(),
        shutdown_rx.clone(),
        stats.clone(),
        id.clone(),
    ));

    loop {
        tokio::select! {
            _ = events_rx.recv() => {}
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown_ctx.cancelled() => break,
        }
        if shutdown_ctx.is_cancelled() {
            break;
        }

        let result = resource.check_apply(true).await;
        if let Err(e) = &result {
            log::warn!("{id}: check_apply failed: {e}");
        }
        stats.record_check_apply(&id, &result);
    }

    let _ = watch_task.await;
    if let Err(e) = resource.cleanup().await {
        log::warn!("{id}: cleanup failed: {e}");
    }
}

async fn run_watch_with_restart(
    resource: Arc<dyn Resource>,
    shutdown_rx: watch::Receiver<bool>,
    stats: EngineStats,
    id: ResourceId,
) {
    let mut backoff = WATCH_BACKOFF_START;
    loop {
        let mut ctx = ShutdownCtx::new(shutdown_rx.clone());
        match resource.watch(ctx.clone()).await {
            Ok(()) => return,
            Err(e) => {
                log::warn!("{id}: watch failed, restarting: {e}");
                stats.record_watch_restart(&id);
                if ctx.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("scheduled", &self.scheduled.iter().map(|r| r.id()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CrateResult;
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        name: &'static str,
        init_calls: AtomicUsize,
        check_apply_calls: AtomicUsize,
        cleanup_calls: AtomicUsize,
        fail_validate: bool,
    }

    impl Probe {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                init_calls: AtomicUsize::new(0),
                check_apply_calls: AtomicUsize::new(0),
                cleanup_calls: AtomicUsize::new(0),
                fail_validate: false,
            }
        }
    }

    #[async_trait]
    impl Resource for Probe {
        fn id(&self) -> ResourceId {
            ResourceId {
                kind: "probe",
                name: self.name.to_string(),
            }
        }

        fn validate(&self) -> CrateResult<()> {
            if self.fail_validate {
                return Err(Error::configuration_invalid("probe told to fail validate"));
            }
            Ok(())
        }

        async fn init(&self, services: Services) -> CrateResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            services.event();
            Ok(())
        }

        async fn watch(&self, mut ctx: ShutdownCtx) -> CrateResult<()> {
            ctx.cancelled().await;
            Ok(())
        }

        async fn check_apply(&self, _apply_permitted: bool) -> CrateResult<bool> {
            self.check_apply_calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn cmp(&self, _other: &dyn Resource) -> Option<String> {
            None
        }

        async fn cleanup(&self) -> CrateResult<()> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn build_rejects_an_invalid_resource() {
        let mut probe = Probe::new("bad");
        probe.fail_validate = true;
        let resources: Vec<Arc<dyn Resource>> = vec![Arc::new(probe)];

        let err = Engine::build(resources, EngineOptions::default()).unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[tokio::test]
    async fn resource_runs_its_full_lifecycle_and_stops_on_shutdown() {
        let probe = Arc::new(Probe::new("ok"));
        let resources: Vec<Arc<dyn Resource>> = vec![probe.clone()];

        let mut options = EngineOptions::default();
        options.poll_interval = Duration::from_millis(20);
        let (engine, handle) = Engine::build(resources, options).unwrap();

        let run_task = tokio::spawn(engine.run());

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown();
        run_task.await.unwrap().unwrap();

        assert_eq!(probe.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.cleanup_calls.load(Ordering::SeqCst), 1);
        assert!(probe.check_apply_calls.load(Ordering::SeqCst) >= 1);

        let snapshot = handle.stats().snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].last_check_apply_ok, Some(true));
    }

    struct DummyEdgeSource;

    impl crate::resource::autoedge::AutoEdge for DummyEdgeSource {
        fn next_batch(&mut self) -> Option<crate::resource::autoedge::EdgeBatch> {
            None
        }
        fn test(&mut self, _results: &[bool]) {}
    }

    struct WithEdges {
        target: ResourceId,
    }

    #[async_trait]
    impl Resource for WithEdges {
        fn id(&self) -> ResourceId {
            ResourceId {
                kind: "with_edges",
                name: "a".to_string(),
            }
        }
        fn validate(&self) -> CrateResult<()> {
            Ok(())
        }
        async fn init(&self, _: Services) -> CrateResult<()> {
            Ok(())
        }
        async fn watch(&self, mut ctx: ShutdownCtx) -> CrateResult<()> {
            ctx.cancelled().await;
            Ok(())
        }
        async fn check_apply(&self, _: bool) -> CrateResult<bool> {
            Ok(true)
        }
        fn cmp(&self, _: &dyn Resource) -> Option<String> {
            None
        }
        async fn cleanup(&self) -> CrateResult<()> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn autoedges(&self) -> Option<Box<dyn crate::resource::autoedge::AutoEdge>> {
            Some(Box::new(SingleBatch {
                candidates: vec![self.target.clone()],
                done: false,
            }))
        }
    }

    struct SingleBatch {
        candidates: Vec<ResourceId>,
        done: bool,
    }

    impl crate::resource::autoedge::AutoEdge for SingleBatch {
        fn next_batch(&mut self) -> Option<crate::resource::autoedge::EdgeBatch> {
            if self.done {
                return None;
            }
            Some(crate::resource::autoedge::EdgeBatch {
                candidates: self.candidates.clone(),
            })
        }
        fn test(&mut self, _results: &[bool]) {
            self.done = true;
        }
    }

    #[test]
    fn autoedge_resolution_finds_an_existing_target() {
        let target_id = ResourceId {
            kind: "probe",
            name: "target".to_string(),
        };
        let target: Arc<dyn Resource> = Arc::new(Probe::new("target"));
        let with_edges: Arc<dyn Resource> = Arc::new(WithEdges {
            target: target_id.clone(),
        });

        let resources = vec![target, with_edges];
        let ids: HashSet<ResourceId> = resources.iter().map(|r| r.id()).collect();
        let edges = resolve_autoedges(&ids, &resources);

        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].1, target_id);
    }
}
