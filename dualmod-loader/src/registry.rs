//! Module registry and dependency graph
//!
//! One registry per loader. It owns every module record and the edges
//! between them; everything else refers to modules by location and
//! receives cloned [`ModuleRecord`] views.

use crate::environment::ModuleEnvironment;
use crate::location::{ModuleFormat, ModuleLocation, ResolutionMode};
use crate::namespace::Namespace;
use crate::value::Value;
use crate::{LoadError, Result};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Identifies one top-level load driving evaluation
pub(crate) type TaskId = u64;

/// Lifecycle state of a module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleState {
    Unlinked,
    Linking,
    Linked,
    Evaluating,
    Evaluated,
    Errored,
}

/// An edge of the dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    /// Specifier as written by the requester
    pub specifier: String,
    /// Where it resolved
    pub location: ModuleLocation,
    /// How it was requested
    pub mode: ResolutionMode,
    /// Request inside a function body, or asynchronous
    pub deferred: bool,
}

/// An edge lying on a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CyclicEdge {
    pub from: ModuleLocation,
    pub to: ModuleLocation,
    pub mode: ResolutionMode,
    pub deferred: bool,
}

/// A point-in-time view of a module record
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub location: ModuleLocation,
    pub format: ModuleFormat,
    pub state: ModuleState,
    pub namespace: Option<Namespace>,
    pub dependencies: Vec<Dependency>,
    /// Current `module.exports` (legacy modules only)
    pub exports: Option<Value>,
    /// Failure of an errored record
    pub error: Option<LoadError>,
    /// Top-level `await` in the module source
    pub top_level_await: bool,
}

/// A record planned by the linker, ready to be committed
#[derive(Debug)]
pub(crate) struct LinkedModule {
    pub location: ModuleLocation,
    pub format: ModuleFormat,
    pub namespace: Namespace,
    pub environment: Arc<ModuleEnvironment>,
    pub dependencies: Vec<Dependency>,
    pub top_level_await: bool,
}

/// Outcome of trying to start a module's evaluation
#[derive(Debug)]
pub(crate) enum Begin {
    /// The caller now owns the evaluation
    Started,
    /// Evaluation already completed
    Evaluated(Namespace),
    /// Evaluation already failed
    Errored(LoadError),
    /// Another evaluation of the module is in progress
    InFlight { owner: TaskId, done: Arc<Notify> },
    /// The module has not been linked
    NotLinked,
}

#[derive(Debug)]
struct RecordEntry {
    location: ModuleLocation,
    format: ModuleFormat,
    state: ModuleState,
    namespace: Option<Namespace>,
    dependencies: Vec<Dependency>,
    error: Option<LoadError>,
    environment: Option<Arc<ModuleEnvironment>>,
    top_level_await: bool,
    done: Arc<Notify>,
}

impl RecordEntry {
    fn new(location: ModuleLocation, format: ModuleFormat) -> Self {
        Self {
            location,
            format,
            state: ModuleState::Unlinked,
            namespace: None,
            dependencies: Vec::new(),
            error: None,
            environment: None,
            top_level_await: false,
            done: Arc::new(Notify::new()),
        }
    }

    fn view(&self) -> ModuleRecord {
        let exports = match (self.format, &self.environment) {
            (ModuleFormat::Legacy, Some(env)) => Some(env.module_exports()),
            _ => None,
        };
        ModuleRecord {
            location: self.location.clone(),
            format: self.format,
            state: self.state,
            namespace: self.namespace.clone(),
            dependencies: self.dependencies.clone(),
            exports,
            error: self.error.clone(),
            top_level_await: self.top_level_await,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    records: FxHashMap<ModuleLocation, RecordEntry>,
    /// Insertion order, for deterministic iteration
    order: Vec<ModuleLocation>,
    /// Task currently evaluating each in-flight module
    owners: FxHashMap<ModuleLocation, TaskId>,
    /// Module each blocked task is waiting on
    waiting: FxHashMap<TaskId, ModuleLocation>,
}

/// Thread-safe module registry
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `location`, created Unlinked if absent
    pub fn get_or_create(&self, location: &ModuleLocation, format: ModuleFormat) -> ModuleRecord {
        let mut inner = self.inner.write();
        if let Some(entry) = inner.records.get(location) {
            return entry.view();
        }
        trace!("Creating record for {} ({})", location, format);
        let entry = RecordEntry::new(location.clone(), format);
        let view = entry.view();
        inner.order.push(location.clone());
        inner.records.insert(location.clone(), entry);
        view
    }

    /// Record view for `location`
    pub fn get(&self, location: &ModuleLocation) -> Option<ModuleRecord> {
        self.inner.read().records.get(location).map(RecordEntry::view)
    }

    pub fn contains(&self, location: &ModuleLocation) -> bool {
        self.inner.read().records.contains_key(location)
    }

    pub fn state(&self, location: &ModuleLocation) -> Option<ModuleState> {
        self.inner.read().records.get(location).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    /// All known locations in creation order
    pub fn locations(&self) -> Vec<ModuleLocation> {
        self.inner.read().order.clone()
    }

    /// Record an edge; duplicates are ignored
    pub fn add_dependency(&self, from: &ModuleLocation, dependency: Dependency) -> bool {
        let mut inner = self.inner.write();
        match inner.records.get_mut(from) {
            Some(entry) => {
                if !entry.dependencies.contains(&dependency) {
                    trace!("Edge {} -> {} ({})", from, dependency.location, dependency.mode);
                    entry.dependencies.push(dependency);
                }
                true
            }
            None => false,
        }
    }

    /// Outgoing edges of `location`, in request order
    pub fn dependencies(&self, location: &ModuleLocation) -> Vec<Dependency> {
        self.inner
            .read()
            .records
            .get(location)
            .map(|entry| entry.dependencies.clone())
            .unwrap_or_default()
    }

    /// Every edge that lies on a cycle of the current graph
    pub fn detect_cycle(&self) -> Vec<CyclicEdge> {
        let inner = self.inner.read();
        let graph: FxHashMap<ModuleLocation, Vec<Dependency>> = inner
            .records
            .iter()
            .map(|(location, entry)| (location.clone(), entry.dependencies.clone()))
            .collect();
        cyclic_edges(&graph, &inner.order)
    }

    /// Forget every record
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        debug!("Clearing {} module records", inner.records.len());
        for entry in inner.records.values() {
            entry.done.notify_waiters();
        }
        *inner = RegistryInner::default();
    }

    /// Move claimed records to Linked; records past linking are left alone
    pub(crate) fn commit(&self, modules: Vec<LinkedModule>) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        for module in modules {
            if !inner.records.contains_key(&module.location) {
                inner.order.push(module.location.clone());
                inner.records.insert(
                    module.location.clone(),
                    RecordEntry::new(module.location.clone(), module.format),
                );
            }
            let Some(entry) = inner.records.get_mut(&module.location) else {
                continue;
            };
            if !matches!(entry.state, ModuleState::Unlinked | ModuleState::Linking) {
                continue;
            }
            debug!("Linked {} ({})", module.location, module.format);
            entry.format = module.format;
            entry.state = ModuleState::Linked;
            entry.namespace = Some(module.namespace);
            entry.environment = Some(module.environment);
            entry.dependencies = module.dependencies;
            entry.top_level_await = module.top_level_await;
        }
    }

    /// Remove a record created by a link that failed
    pub(crate) fn discard(&self, location: &ModuleLocation) {
        let mut inner = self.inner.write();
        if inner.records.remove(location).is_some() {
            trace!("Discarding record for {}", location);
            inner.order.retain(|known| known != location);
        }
    }

    pub(crate) fn set_state(&self, location: &ModuleLocation, state: ModuleState) {
        if let Some(entry) = self.inner.write().records.get_mut(location) {
            trace!("{}: {:?} -> {:?}", location, entry.state, state);
            entry.state = state;
        }
    }

    pub(crate) fn environment(&self, location: &ModuleLocation) -> Option<Arc<ModuleEnvironment>> {
        self.inner
            .read()
            .records
            .get(location)
            .and_then(|entry| entry.environment.clone())
    }

    pub(crate) fn namespace(&self, location: &ModuleLocation) -> Option<Namespace> {
        self.inner
            .read()
            .records
            .get(location)
            .and_then(|entry| entry.namespace.clone())
    }

    /// Atomically move a Linked record to Evaluating for `task`
    pub(crate) fn begin_evaluation(&self, location: &ModuleLocation, task: TaskId) -> Begin {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(entry) = inner.records.get_mut(location) else {
            return Begin::NotLinked;
        };
        match entry.state {
            ModuleState::Linked => {
                entry.state = ModuleState::Evaluating;
                inner.owners.insert(location.clone(), task);
                trace!("Evaluating {} (task {})", location, task);
                Begin::Started
            }
            ModuleState::Evaluated => match &entry.namespace {
                Some(namespace) => Begin::Evaluated(namespace.clone()),
                None => Begin::NotLinked,
            },
            ModuleState::Errored => Begin::Errored(entry.error.clone().unwrap_or_else(|| {
                LoadError::EvaluationAbandoned {
                    module: location.clone(),
                }
            })),
            ModuleState::Evaluating => {
                let done = entry.done.clone();
                let owner = inner.owners.get(location).copied().unwrap_or(task);
                Begin::InFlight { owner, done }
            }
            ModuleState::Unlinked | ModuleState::Linking => Begin::NotLinked,
        }
    }

    /// Record the outcome of an evaluation and wake waiters
    pub(crate) fn finish_evaluation(&self, location: &ModuleLocation, result: &Result<()>) {
        let mut inner = self.inner.write();
        inner.owners.remove(location);
        if let Some(entry) = inner.records.get_mut(location) {
            match result {
                Ok(()) => {
                    entry.state = ModuleState::Evaluated;
                    debug!("Evaluated {}", location);
                }
                Err(error) => {
                    entry.state = ModuleState::Errored;
                    entry.error = Some(error.clone());
                    debug!("Module {} errored: {}", location, error);
                }
            }
            entry.done.notify_waiters();
        }
    }

    /// Mark an in-flight record as failed; completed records are untouched
    pub(crate) fn abandon(&self, location: &ModuleLocation, error: LoadError) {
        let mut inner = self.inner.write();
        inner.owners.remove(location);
        if let Some(entry) = inner.records.get_mut(location) {
            if matches!(entry.state, ModuleState::Evaluating | ModuleState::Linked) {
                debug!("Abandoning {}: {}", location, error);
                entry.state = ModuleState::Errored;
                entry.error = Some(error);
                entry.done.notify_waiters();
            }
        }
    }

    /// Register `task` as waiting for `location`, unless that wait would
    /// close a waits-for cycle between tasks. Returns whether it registered.
    pub(crate) fn try_wait(&self, task: TaskId, location: &ModuleLocation) -> bool {
        let mut inner = self.inner.write();
        if inner.would_deadlock(task, location) {
            trace!("Task {} would deadlock waiting for {}", task, location);
            return false;
        }
        inner.waiting.insert(task, location.clone());
        true
    }

    /// Clear the waiting mark of `task`
    pub(crate) fn stop_waiting(&self, task: TaskId) {
        self.inner.write().waiting.remove(&task);
    }
}

impl RegistryInner {
    fn would_deadlock(&self, task: TaskId, location: &ModuleLocation) -> bool {
        let mut seen = FxHashSet::default();
        let mut current = location;
        while let Some(&owner) = self.owners.get(current) {
            if owner == task {
                return true;
            }
            if !seen.insert(owner) {
                return false;
            }
            match self.waiting.get(&owner) {
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }
}

/// Strongly connected component id of every node reachable from `order`
pub(crate) fn strongly_connected(
    graph: &FxHashMap<ModuleLocation, Vec<Dependency>>,
    order: &[ModuleLocation],
) -> FxHashMap<ModuleLocation, usize> {
    let mut tarjan = Tarjan {
        graph,
        next_index: 0,
        indices: FxHashMap::default(),
        lowlinks: FxHashMap::default(),
        stack: Vec::new(),
        on_stack: FxHashSet::default(),
        components: FxHashMap::default(),
        next_component: 0,
    };
    for location in order {
        if !tarjan.indices.contains_key(location) {
            tarjan.visit(location);
        }
    }
    tarjan
        .components
        .into_iter()
        .map(|(location, component)| (location.clone(), component))
        .collect()
}

/// Edges whose endpoints share a strongly connected component
pub(crate) fn cyclic_edges(
    graph: &FxHashMap<ModuleLocation, Vec<Dependency>>,
    order: &[ModuleLocation],
) -> Vec<CyclicEdge> {
    let components = strongly_connected(graph, order);
    let mut edges = Vec::new();
    for from in order {
        let Some(dependencies) = graph.get(from) else {
            continue;
        };
        for dependency in dependencies {
            let same = match (components.get(from), components.get(&dependency.location)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            if same {
                edges.push(CyclicEdge {
                    from: from.clone(),
                    to: dependency.location.clone(),
                    mode: dependency.mode,
                    deferred: dependency.deferred,
                });
            }
        }
    }
    edges
}

struct Tarjan<'g> {
    graph: &'g FxHashMap<ModuleLocation, Vec<Dependency>>,
    next_index: usize,
    indices: FxHashMap<&'g ModuleLocation, usize>,
    lowlinks: FxHashMap<&'g ModuleLocation, usize>,
    stack: Vec<&'g ModuleLocation>,
    on_stack: FxHashSet<&'g ModuleLocation>,
    components: FxHashMap<&'g ModuleLocation, usize>,
    next_component: usize,
}

impl<'g> Tarjan<'g> {
    fn visit(&mut self, node: &'g ModuleLocation) {
        let index = self.next_index;
        self.next_index += 1;
        self.indices.insert(node, index);
        self.lowlinks.insert(node, index);
        self.stack.push(node);
        self.on_stack.insert(node);

        let graph = self.graph;
        if let Some(dependencies) = graph.get(node) {
            for dependency in dependencies {
                let next = &dependency.location;
                if !self.indices.contains_key(next) {
                    self.visit(next);
                    let low = self.lowlinks[next].min(self.lowlinks[node]);
                    self.lowlinks.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.indices[next].min(self.lowlinks[node]);
                    self.lowlinks.insert(node, low);
                }
            }
        }

        if self.lowlinks[node] == self.indices[node] {
            let component = self.next_component;
            self.next_component += 1;
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                self.components.insert(member, component);
                if member == node {
                    break;
                }
            }
        }
    }
}
