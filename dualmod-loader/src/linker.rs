//! Transactional linking
//!
//! Everything reachable from the entry through static imports is read,
//! classified, scanned and resolved. Each module gets a record in the
//! Linking state as it is planned; its namespace, environment and edges
//! are built off-registry. Namespaces are shaped, named imports checked
//! and the cycle policy enforced before anything is committed; a failure
//! removes the records this link created.
//!
//! `require` and `import()` targets are resolved leniently and recorded as
//! edges only; they are linked when the request actually runs.

use crate::analysis::{scope_tokens, ImportBinding, ModuleAnalysis};
use crate::detect::DetectedExports;
use crate::environment::ModuleEnvironment;
use crate::loader::LoaderInner;
use crate::location::{ModuleFormat, ModuleLocation, ResolutionMode};
use crate::namespace::{Binding, Namespace};
use crate::registry::{strongly_connected, Dependency, LinkedModule, ModuleState};
use crate::value::Value;
use crate::{LoadError, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Link `entry` and its static subgraph, unless already linked
pub(crate) fn link(loader: &LoaderInner, entry: &ModuleLocation) -> Result<()> {
    let _link = loader.link_lock.lock();
    if is_linked(loader, entry) {
        return Ok(());
    }

    let mut linker = Linker::new(loader);
    let result = linker.plan(entry).and_then(|()| linker.build());
    match result {
        Ok(modules) => {
            debug!("Committing {} module(s) linked from {}", modules.len(), entry);
            loader.registry.commit(modules);
            Ok(())
        }
        Err(error) => {
            debug!("Linking {} failed: {}", entry, error);
            linker.release();
            Err(error)
        }
    }
}

fn is_linked(loader: &LoaderInner, location: &ModuleLocation) -> bool {
    !matches!(
        loader.registry.state(location),
        None | Some(ModuleState::Unlinked) | Some(ModuleState::Linking)
    )
}

enum Source {
    Json,
    Legacy(DetectedExports),
    Declarative(ModuleAnalysis),
}

struct Planned {
    format: ModuleFormat,
    source: Source,
    dependencies: Vec<Dependency>,
    top_level_await: bool,
}

impl Planned {
    fn target(&self, specifier: &str) -> Option<&ModuleLocation> {
        self.dependencies
            .iter()
            .find(|d| d.mode == ResolutionMode::Static && d.specifier == specifier)
            .map(|d| &d.location)
    }
}

/// Where an export that is not a local binding comes from
enum Indirect {
    Name(ModuleLocation, String),
    Namespace(ModuleLocation),
}

#[derive(Default)]
struct ExportTable {
    locals: FxHashMap<String, Binding>,
    indirect: FxHashMap<String, Indirect>,
    stars: Vec<ModuleLocation>,
}

#[derive(Clone)]
enum Resolved {
    Binding(Binding),
    NamespaceOf(ModuleLocation),
}

impl Resolved {
    fn same(&self, other: &Resolved) -> bool {
        match (self, other) {
            (Resolved::Binding(a), Resolved::Binding(b)) => a.ptr_eq(b),
            (Resolved::NamespaceOf(a), Resolved::NamespaceOf(b)) => a == b,
            _ => false,
        }
    }
}

enum Lookup {
    Found(Resolved),
    Missing,
    Ambiguous,
}

/// A record moved to Linking by this link
struct Claim {
    location: ModuleLocation,
    created: bool,
}

/// Position of a module on the replayed evaluation stack
struct Replay {
    location: ModuleLocation,
    next: usize,
    /// Stack index of the first module of the innermost synchronous require
    bridge: usize,
}

struct Linker<'l> {
    loader: &'l LoaderInner,
    planned: FxHashMap<ModuleLocation, Planned>,
    order: Vec<ModuleLocation>,
    claimed: Vec<Claim>,
    tables: FxHashMap<ModuleLocation, ExportTable>,
}

impl<'l> Linker<'l> {
    fn new(loader: &'l LoaderInner) -> Self {
        Self {
            loader,
            planned: FxHashMap::default(),
            order: Vec::new(),
            claimed: Vec::new(),
            tables: FxHashMap::default(),
        }
    }

    /// Move the record of `location` to Linking, creating it if needed
    fn claim(&mut self, location: &ModuleLocation, format: ModuleFormat) {
        let registry = &self.loader.registry;
        let created = !registry.contains(location);
        if registry.get_or_create(location, format).state == ModuleState::Unlinked {
            registry.set_state(location, ModuleState::Linking);
            self.claimed.push(Claim {
                location: location.clone(),
                created,
            });
        }
    }

    /// Drop records this link created; put older ones back to Unlinked
    fn release(&self) {
        for claim in &self.claimed {
            if claim.created {
                self.loader.registry.discard(&claim.location);
            } else {
                self.loader.registry.set_state(&claim.location, ModuleState::Unlinked);
            }
        }
    }

    fn plan(&mut self, entry: &ModuleLocation) -> Result<()> {
        let mut queue = vec![entry.clone()];
        while let Some(location) = queue.pop() {
            if self.planned.contains_key(&location) || is_linked(self.loader, &location) {
                continue;
            }
            let format = self.loader.classifier.classify(&location)?;
            self.claim(&location, format);

            let planned = self.plan_module(&location, format)?;
            // Reverse so the stack visits imports in source order
            for dependency in planned.dependencies.iter().rev() {
                if dependency.mode == ResolutionMode::Static {
                    queue.push(dependency.location.clone());
                }
            }
            self.order.push(location.clone());
            self.planned.insert(location, planned);
        }
        Ok(())
    }

    fn plan_module(&self, location: &ModuleLocation, format: ModuleFormat) -> Result<Planned> {
        if location.extension() == Some("json") {
            return Ok(Planned {
                format: ModuleFormat::Legacy,
                source: Source::Json,
                dependencies: Vec::new(),
                top_level_await: false,
            });
        }

        let text = self
            .loader
            .fs
            .read_to_string(location.path())
            .map_err(|e| LoadError::io(location.path(), e))?;
        let tokens = scope_tokens(&text);
        let analysis = ModuleAnalysis::from_tokens(&tokens);
        let resolver = &self.loader.resolver;
        let mut dependencies: Vec<Dependency> = Vec::new();
        let mut push = |dependency: Dependency| {
            if !dependencies.contains(&dependency) {
                dependencies.push(dependency);
            }
        };

        match format {
            ModuleFormat::Declarative => {
                for decl in &analysis.imports {
                    let target = resolver.resolve(&decl.specifier, location, ResolutionMode::Static)?;
                    push(Dependency {
                        specifier: decl.specifier.clone(),
                        location: target,
                        mode: ResolutionMode::Static,
                        deferred: false,
                    });
                }
            }
            ModuleFormat::Legacy => {
                for call in &analysis.requires {
                    match resolver.resolve(&call.specifier, location, ResolutionMode::DynamicSync) {
                        Ok(target) => push(Dependency {
                            specifier: call.specifier.clone(),
                            location: target,
                            mode: ResolutionMode::DynamicSync,
                            deferred: call.deferred,
                        }),
                        Err(error) => skip_request("require", &call.specifier, location, &error),
                    }
                }
            }
        }

        for call in &analysis.dynamic_imports {
            match resolver.resolve(&call.specifier, location, ResolutionMode::DynamicAsync) {
                Ok(target) => push(Dependency {
                    specifier: call.specifier.clone(),
                    location: target,
                    mode: ResolutionMode::DynamicAsync,
                    deferred: true,
                }),
                Err(error) => skip_request("import", &call.specifier, location, &error),
            }
        }

        let (source, top_level_await) = match format {
            ModuleFormat::Declarative => {
                let tla = analysis.has_top_level_await;
                (Source::Declarative(analysis), tla)
            }
            ModuleFormat::Legacy => {
                let mut visited = FxHashSet::default();
                visited.insert(location.clone());
                let detected = self.follow_reexports(location, DetectedExports::from_tokens(&tokens), &mut visited);
                (Source::Legacy(detected), false)
            }
        };

        Ok(Planned {
            format,
            source,
            dependencies,
            top_level_await,
        })
    }

    /// Merge names of legacy modules re-exported through `module.exports = require(..)`
    fn follow_reexports(
        &self,
        location: &ModuleLocation,
        mut detected: DetectedExports,
        visited: &mut FxHashSet<ModuleLocation>,
    ) -> DetectedExports {
        for specifier in detected.reexports.clone() {
            let Ok(target) = self
                .loader
                .resolver
                .resolve(&specifier, location, ResolutionMode::DynamicSync)
            else {
                continue;
            };
            if !visited.insert(target.clone())
                || target.extension() == Some("json")
                || !matches!(self.loader.classifier.classify(&target), Ok(ModuleFormat::Legacy))
            {
                continue;
            }
            if let Ok(text) = self.loader.fs.read_to_string(target.path()) {
                let nested = self.follow_reexports(&target, DetectedExports::detect(&text), visited);
                detected.merge(&nested);
            }
        }
        detected
    }

    fn format_of(&self, location: &ModuleLocation) -> Option<ModuleFormat> {
        match self.planned.get(location) {
            Some(planned) => Some(planned.format),
            None => self.loader.registry.get(location).map(|record| record.format),
        }
    }

    fn is_finished(&self, location: &ModuleLocation) -> bool {
        matches!(
            self.loader.registry.state(location),
            Some(ModuleState::Evaluated | ModuleState::Errored)
        )
    }

    /// Reject eager mixed-format cycles that cannot complete
    ///
    /// Every eager `require` of a declarative module that closes a fresh
    /// cycle is replayed in evaluation order; see [`Linker::require_stalls`].
    fn check_cycles(&self) -> Result<()> {
        let registry = &self.loader.registry;
        let mut order = registry.locations();
        let mut graph: FxHashMap<ModuleLocation, Vec<Dependency>> = order
            .iter()
            .map(|location| {
                let eager = registry
                    .dependencies(location)
                    .into_iter()
                    .filter(|d| !d.deferred)
                    .collect();
                (location.clone(), eager)
            })
            .collect();
        for location in &self.order {
            let eager = self.planned[location]
                .dependencies
                .iter()
                .filter(|d| !d.deferred)
                .cloned()
                .collect();
            if graph.insert(location.clone(), eager).is_none() {
                order.push(location.clone());
            }
        }

        let components = strongly_connected(&graph, &order);
        let fresh: FxHashSet<usize> = self
            .order
            .iter()
            .filter_map(|location| components.get(location).copied())
            .collect();

        for from in &order {
            if self.format_of(from) != Some(ModuleFormat::Legacy) || self.is_finished(from) {
                continue;
            }
            for dependency in &graph[from] {
                let to = &dependency.location;
                let cyclic = match (components.get(from), components.get(to)) {
                    (Some(a), Some(b)) => a == b && fresh.contains(a),
                    _ => false,
                };
                if cyclic
                    && dependency.mode == ResolutionMode::DynamicSync
                    && self.format_of(to) == Some(ModuleFormat::Declarative)
                    && self.require_stalls(&graph, from, to)
                {
                    return Err(LoadError::RequireCycleModule {
                        requester: from.clone(),
                        target: to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Whether `from` requiring `to` comes back to a module still being
    /// evaluated in a way that cannot be served.
    ///
    /// The replay follows eager edges depth first in request order, the way
    /// evaluation does. Reaching a module on the stack is fine for a legacy
    /// `require` of a legacy module (it sees the partial exports) and for a
    /// static import of a declarative module entered after the innermost
    /// synchronous require. Anything else would need a module to finish
    /// before the requester can.
    fn require_stalls(
        &self,
        graph: &FxHashMap<ModuleLocation, Vec<Dependency>>,
        from: &ModuleLocation,
        to: &ModuleLocation,
    ) -> bool {
        let mut stack = vec![
            Replay {
                location: from.clone(),
                next: 0,
                bridge: 0,
            },
            Replay {
                location: to.clone(),
                next: 0,
                bridge: 1,
            },
        ];
        let mut on_stack: FxHashMap<ModuleLocation, usize> = FxHashMap::default();
        on_stack.insert(from.clone(), 0);
        on_stack.insert(to.clone(), 1);
        let mut visited: FxHashSet<ModuleLocation> = on_stack.keys().cloned().collect();

        // the replay ends once `to` has completed and control is back in `from`
        while stack.len() > 1 {
            let Some(top) = stack.last_mut() else {
                break;
            };
            let next = graph
                .get(&top.location)
                .and_then(|edges| edges.get(top.next))
                .cloned();
            let Some(dependency) = next else {
                on_stack.remove(&top.location);
                stack.pop();
                continue;
            };
            top.next += 1;
            let requester = top.location.clone();
            let bridge = top.bridge;

            let target = dependency.location;
            let requester_format = self.format_of(&requester);
            let target_format = self.format_of(&target);
            if let Some(&position) = on_stack.get(&target) {
                let served = match (requester_format, target_format, dependency.mode) {
                    (Some(ModuleFormat::Legacy), Some(ModuleFormat::Legacy), ResolutionMode::DynamicSync) => true,
                    (Some(ModuleFormat::Declarative), Some(ModuleFormat::Declarative), ResolutionMode::Static) => {
                        position >= bridge
                    }
                    _ => false,
                };
                if !served {
                    trace!("{} reaches {} while it is still evaluating", requester, target);
                    return true;
                }
                continue;
            }
            if self.is_finished(&target) || !visited.insert(target.clone()) {
                continue;
            }

            let bridge = if requester_format == Some(ModuleFormat::Legacy)
                && dependency.mode == ResolutionMode::DynamicSync
                && target_format == Some(ModuleFormat::Declarative)
            {
                stack.len()
            } else {
                bridge
            };
            on_stack.insert(target.clone(), stack.len());
            stack.push(Replay {
                location: target,
                next: 0,
                bridge,
            });
        }
        false
    }

    fn build(&mut self) -> Result<Vec<LinkedModule>> {
        self.check_cycles()?;

        let mut environments: FxHashMap<ModuleLocation, ModuleEnvironment> = FxHashMap::default();
        for location in &self.order {
            let planned = &self.planned[location];
            let mut env = ModuleEnvironment::new(location.clone(), planned.format);
            let table = export_table(&mut env, planned);
            self.tables.insert(location.clone(), table);
            environments.insert(location.clone(), env);
        }

        let mut pending: Vec<(Binding, ModuleLocation)> = Vec::new();
        let mut namespaces: FxHashMap<ModuleLocation, Namespace> = FxHashMap::default();
        for location in &self.order {
            let mut seen = FxHashSet::default();
            seen.insert(location.clone());
            let mut bindings = Vec::new();
            for name in self.export_names(location, &mut seen) {
                match self.lookup(location, &name, &mut FxHashSet::default()) {
                    Lookup::Found(Resolved::Binding(binding)) => bindings.push((name, binding)),
                    Lookup::Found(Resolved::NamespaceOf(target)) => {
                        let binding = Binding::live();
                        pending.push((binding.clone(), target));
                        bindings.push((name, binding));
                    }
                    Lookup::Missing | Lookup::Ambiguous => {
                        trace!("Dropping unresolvable or ambiguous export '{}' of {}", name, location)
                    }
                }
            }
            namespaces.insert(location.clone(), Namespace::new(location.clone(), bindings));
        }

        for location in &self.order {
            let planned = &self.planned[location];
            let Source::Declarative(analysis) = &planned.source else {
                continue;
            };
            let Some(env) = environments.get_mut(location) else {
                continue;
            };
            for decl in &analysis.imports {
                let Some(target) = planned.target(&decl.specifier) else {
                    continue;
                };
                for binding in &decl.bindings {
                    let (imported, local) = match binding {
                        ImportBinding::Named { imported, local } => (imported, Some(local)),
                        ImportBinding::Reexport { imported, .. } => (imported, None),
                        ImportBinding::Namespace { local } => {
                            let cell = Binding::live();
                            pending.push((cell.clone(), target.clone()));
                            env.bind_import(local, cell);
                            continue;
                        }
                        ImportBinding::ReexportAll { .. } => continue,
                    };
                    let resolved = match self.lookup(target, imported, &mut FxHashSet::default()) {
                        Lookup::Found(resolved) => resolved,
                        Lookup::Missing | Lookup::Ambiguous => {
                            return Err(LoadError::NamedExportNotFound {
                                name: imported.clone(),
                                module: target.clone(),
                                importer: Some(location.clone()),
                            })
                        }
                    };
                    if let Some(local) = local {
                        let cell = match resolved {
                            Resolved::Binding(binding) => binding,
                            Resolved::NamespaceOf(of) => {
                                let cell = Binding::live();
                                pending.push((cell.clone(), of));
                                cell
                            }
                        };
                        env.bind_import(local, cell);
                    }
                }
            }
        }

        for (cell, target) in pending {
            let namespace = namespaces
                .get(&target)
                .cloned()
                .or_else(|| self.loader.registry.namespace(&target));
            if let Some(namespace) = namespace {
                cell.set(Value::Namespace(namespace));
            }
        }

        let mut modules = Vec::with_capacity(self.order.len());
        for location in &self.order {
            let (Some(planned), Some(env), Some(namespace)) = (
                self.planned.remove(location),
                environments.remove(location),
                namespaces.remove(location),
            ) else {
                continue;
            };
            modules.push(LinkedModule {
                location: location.clone(),
                format: planned.format,
                namespace,
                environment: Arc::new(env),
                dependencies: planned.dependencies,
                top_level_await: planned.top_level_await,
            });
        }
        Ok(modules)
    }

    /// Names a module exports, star re-exports included
    fn export_names(&self, location: &ModuleLocation, seen: &mut FxHashSet<ModuleLocation>) -> BTreeSet<String> {
        let Some(table) = self.tables.get(location) else {
            return self
                .loader
                .registry
                .namespace(location)
                .map(|namespace| namespace.names().map(str::to_string).collect())
                .unwrap_or_default();
        };

        let mut names: BTreeSet<String> = table.locals.keys().cloned().collect();
        names.extend(table.indirect.keys().cloned());
        for star in &table.stars {
            if seen.insert(star.clone()) {
                names.extend(
                    self.export_names(star, seen)
                        .into_iter()
                        .filter(|name| name != "default"),
                );
            }
        }
        names
    }

    /// Find the binding behind export `name` of `location`
    fn lookup(
        &self,
        location: &ModuleLocation,
        name: &str,
        visited: &mut FxHashSet<(ModuleLocation, String)>,
    ) -> Lookup {
        let Some(table) = self.tables.get(location) else {
            return match self
                .loader
                .registry
                .namespace(location)
                .and_then(|namespace| namespace.binding(name).cloned())
            {
                Some(binding) => Lookup::Found(Resolved::Binding(binding)),
                None => Lookup::Missing,
            };
        };
        if !visited.insert((location.clone(), name.to_string())) {
            return Lookup::Missing;
        }

        if let Some(binding) = table.locals.get(name) {
            return Lookup::Found(Resolved::Binding(binding.clone()));
        }
        match table.indirect.get(name) {
            Some(Indirect::Name(target, imported)) => return self.lookup(target, imported, visited),
            Some(Indirect::Namespace(target)) => return Lookup::Found(Resolved::NamespaceOf(target.clone())),
            None => {}
        }
        if name == "default" {
            return Lookup::Missing;
        }

        let mut found: Option<Resolved> = None;
        for star in &table.stars {
            match self.lookup(star, name, visited) {
                Lookup::Found(resolved) => {
                    if found.is_none() {
                        found = Some(resolved);
                    } else if !found.as_ref().map_or(false, |previous| previous.same(&resolved)) {
                        return Lookup::Ambiguous;
                    }
                }
                Lookup::Ambiguous => return Lookup::Ambiguous,
                Lookup::Missing => {}
            }
        }
        found.map_or(Lookup::Missing, Lookup::Found)
    }
}

/// Log a dynamic request left out of the graph
fn skip_request(kind: &str, specifier: &str, location: &ModuleLocation, error: &LoadError) {
    if error.is_resolution_error() {
        trace!("Skipping {}('{}') in {}: {}", kind, specifier, location, error);
    } else {
        warn!("Skipping {}('{}') in {}: {}", kind, specifier, location, error);
    }
}

/// Create the module's own bindings and describe its exports
fn export_table(env: &mut ModuleEnvironment, planned: &Planned) -> ExportTable {
    let mut table = ExportTable::default();
    match &planned.source {
        Source::Json => {
            let binding = Binding::snapshot();
            env.define_local("default", "default", binding.clone());
            table.locals.insert("default".to_string(), binding);
        }
        Source::Legacy(detected) => {
            let names = std::iter::once("default").chain(detected.names.iter().map(String::as_str));
            for name in names {
                let binding = Binding::snapshot();
                env.define_local(name, name, binding.clone());
                table.locals.insert(name.to_string(), binding);
            }
        }
        Source::Declarative(analysis) => {
            let mut imported: FxHashMap<&str, Indirect> = FxHashMap::default();
            for decl in &analysis.imports {
                let Some(target) = planned.target(&decl.specifier) else {
                    continue;
                };
                for binding in &decl.bindings {
                    match binding {
                        ImportBinding::Named { imported: name, local } => {
                            imported.insert(local.as_str(), Indirect::Name(target.clone(), name.clone()));
                        }
                        ImportBinding::Namespace { local } => {
                            imported.insert(local.as_str(), Indirect::Namespace(target.clone()));
                        }
                        ImportBinding::Reexport { imported: name, exported } => {
                            table
                                .indirect
                                .insert(exported.clone(), Indirect::Name(target.clone(), name.clone()));
                        }
                        ImportBinding::ReexportAll { exported: Some(exported) } => {
                            table
                                .indirect
                                .insert(exported.clone(), Indirect::Namespace(target.clone()));
                        }
                        ImportBinding::ReexportAll { exported: None } => {
                            if !table.stars.contains(target) {
                                table.stars.push(target.clone());
                            }
                        }
                    }
                }
            }

            let mut cells: FxHashMap<&str, Binding> = FxHashMap::default();
            for export in &analysis.local_exports {
                match imported.get(export.local.as_str()) {
                    Some(Indirect::Name(target, name)) => {
                        table
                            .indirect
                            .insert(export.exported.clone(), Indirect::Name(target.clone(), name.clone()));
                    }
                    Some(Indirect::Namespace(target)) => {
                        table
                            .indirect
                            .insert(export.exported.clone(), Indirect::Namespace(target.clone()));
                    }
                    None => {
                        let binding = cells
                            .entry(export.local.as_str())
                            .or_insert_with(Binding::live)
                            .clone();
                        env.define_local(&export.local, &export.exported, binding.clone());
                        table.locals.insert(export.exported.clone(), binding);
                    }
                }
            }
        }
    }
    table
}
