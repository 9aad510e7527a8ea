//! Module loading and evaluation

use crate::body::{BodyHost, BodyTable};
use crate::bridge;
use crate::classify::FormatClassifier;
use crate::environment::ModuleEnvironment;
use crate::fs::{FileSystem, RealFs};
use crate::linker;
use crate::location::{ModuleFormat, ModuleLocation, ResolutionMode};
use crate::namespace::Namespace;
use crate::package::PackageCache;
use crate::registry::{Begin, Dependency, ModuleRegistry, ModuleState, TaskId};
use crate::resolver::SpecifierResolver;
use crate::value::{ObjectRef, Value};
use crate::{LoadError, LoaderConfig, Result};
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, trace};

/// Builder for [`ModuleLoader`]
#[derive(Default)]
pub struct LoaderBuilder {
    config: LoaderConfig,
    fs: Option<Arc<dyn FileSystem>>,
    bodies: Option<Arc<dyn BodyHost>>,
}

impl LoaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// File system to resolve against (default: the host file system)
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Where module bodies come from (default: none, every module is empty)
    pub fn bodies(mut self, bodies: impl BodyHost + 'static) -> Self {
        self.bodies = Some(Arc::new(bodies));
        self
    }

    pub fn build(self) -> ModuleLoader {
        let config = Arc::new(self.config);
        let fs = self.fs.unwrap_or_else(|| Arc::new(RealFs));
        let packages = PackageCache::new(fs.clone());
        let resolver = SpecifierResolver::new(fs.clone(), packages.clone(), config.clone());
        let classifier = FormatClassifier::new(fs.clone(), packages, config.clone());

        ModuleLoader {
            inner: Arc::new(LoaderInner {
                config,
                fs,
                resolver,
                classifier,
                registry: ModuleRegistry::new(),
                bodies: self.bodies.unwrap_or_else(|| Arc::new(BodyTable::new())),
                timeline: ReentrantMutex::new(()),
                link_lock: Mutex::new(()),
                main: Mutex::new(None),
                next_task: AtomicU64::new(1),
            }),
        }
    }
}

/// Resolves, links and evaluates modules of both formats in one graph.
///
/// Cloning is cheap and clones share one registry.
#[derive(Clone)]
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    /// Loader over the host file system without module bodies
    pub fn new(config: LoaderConfig) -> Self {
        LoaderBuilder::new().config(config).build()
    }

    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// The registry owning this loader's module records
    pub fn registry(&self) -> &ModuleRegistry {
        &self.inner.registry
    }

    /// Resolve a specifier without touching the registry
    pub fn resolve(
        &self,
        specifier: &str,
        referrer: &ModuleLocation,
        mode: ResolutionMode,
    ) -> Result<ModuleLocation> {
        self.inner.resolver.resolve(specifier, referrer, mode)
    }

    /// Canonical location of an entry file
    pub fn resolve_entry(&self, entry: impl AsRef<Path>) -> Result<ModuleLocation> {
        self.inner.resolver.resolve_entry(entry.as_ref())
    }

    /// Format of a location
    pub fn classify(&self, location: &ModuleLocation) -> Result<ModuleFormat> {
        self.inner.classifier.classify(location)
    }

    /// Link an entry and its static subgraph without evaluating anything
    pub fn link(&self, entry: impl AsRef<Path>) -> Result<ModuleLocation> {
        let location = self.resolve_entry(entry)?;
        linker::link(&self.inner, &location)?;
        Ok(location)
    }

    /// The first entry this loader loaded, if any
    pub fn main(&self) -> Option<ModuleLocation> {
        self.inner.main.lock().clone()
    }

    /// Load and evaluate an entry module
    pub async fn load(&self, entry: impl AsRef<Path>) -> Result<Namespace> {
        let location = self.link(entry)?;
        self.inner.enter_main(&location);
        info!("Loading {}", location);
        let chain = EvalChain::root(self.inner.next_task());
        self.inner.evaluate(location, chain, Request::Entry).await
    }

    /// Load an entry without suspending, under the synchronous bridge rules
    pub fn load_sync(&self, entry: impl AsRef<Path>) -> Result<Namespace> {
        let location = self.link(entry)?;
        self.inner.enter_main(&location);
        info!("Loading {} synchronously", location);
        let chain = EvalChain::root(self.inner.next_task());
        bridge::load_sync(&self.inner, &location, &chain)
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("config", &self.inner.config)
            .field("modules", &self.inner.registry.len())
            .finish()
    }
}

pub(crate) struct LoaderInner {
    pub(crate) config: Arc<LoaderConfig>,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) resolver: SpecifierResolver,
    pub(crate) classifier: FormatClassifier,
    pub(crate) registry: ModuleRegistry,
    bodies: Arc<dyn BodyHost>,
    /// Held for every poll of a module body
    timeline: ReentrantMutex<()>,
    pub(crate) link_lock: Mutex<()>,
    /// First loaded entry
    main: Mutex<Option<ModuleLocation>>,
    next_task: AtomicU64,
}

/// Modules being evaluated by one task, innermost first
#[derive(Debug, Clone)]
pub(crate) struct EvalChain {
    task: TaskId,
    head: Option<Arc<ChainLink>>,
}

#[derive(Debug)]
struct ChainLink {
    location: ModuleLocation,
    parent: Option<Arc<ChainLink>>,
}

impl EvalChain {
    fn root(task: TaskId) -> Self {
        Self { task, head: None }
    }

    fn push(&self, location: ModuleLocation) -> Self {
        Self {
            task: self.task,
            head: Some(Arc::new(ChainLink {
                location,
                parent: self.head.clone(),
            })),
        }
    }

    pub(crate) fn task(&self) -> TaskId {
        self.task
    }

    pub(crate) fn contains(&self, location: &ModuleLocation) -> bool {
        let mut link = self.head.as_deref();
        while let Some(current) = link {
            if &current.location == location {
                return true;
            }
            link = current.parent.as_deref();
        }
        false
    }
}

/// Why a module is being evaluated
#[derive(Debug, Clone)]
pub(crate) enum Request {
    /// Top-level load
    Entry,
    /// Static import by the given module
    Static(ModuleLocation),
    /// `require` by the given module
    Require(ModuleLocation),
    /// `import()`
    Dynamic,
}

/// Marks a record abandoned if its evaluation is dropped midway
struct EvaluationGuard {
    registry: ModuleRegistry,
    location: ModuleLocation,
    armed: bool,
}

impl Drop for EvaluationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon(
                &self.location,
                LoadError::EvaluationAbandoned {
                    module: self.location.clone(),
                },
            );
        }
    }
}

/// Clears a task's waits-for mark
struct WaitMark<'a> {
    registry: &'a ModuleRegistry,
    task: TaskId,
}

impl Drop for WaitMark<'_> {
    fn drop(&mut self) {
        self.registry.stop_waiting(self.task);
    }
}

/// Polls a body future while holding the timeline lock
struct Timeline {
    loader: Arc<LoaderInner>,
    body: BoxFuture<'static, Result<()>>,
}

impl Future for Timeline {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _turn = this.loader.timeline.lock();
        this.body.as_mut().poll(cx)
    }
}

impl LoaderInner {
    fn next_task(&self) -> TaskId {
        self.next_task.fetch_add(1, Ordering::Relaxed)
    }

    fn enter_main(&self, location: &ModuleLocation) {
        let mut main = self.main.lock();
        if main.is_none() {
            debug!("Main module is {}", location);
            *main = Some(location.clone());
        }
    }

    /// Evaluate a linked module at most once and return its namespace
    pub(crate) fn evaluate(
        self: &Arc<Self>,
        location: ModuleLocation,
        chain: EvalChain,
        request: Request,
    ) -> BoxFuture<'static, Result<Namespace>> {
        let loader = Arc::clone(self);
        async move {
            let mut linked = false;
            loop {
                match loader.registry.begin_evaluation(&location, chain.task) {
                    Begin::Started => break,
                    Begin::Evaluated(namespace) => return Ok(namespace),
                    Begin::Errored(error) => return Err(error),
                    Begin::NotLinked => {
                        if linked {
                            return Err(LoadError::EvaluationError {
                                module: location.clone(),
                                message: "module could not be linked".to_string(),
                            });
                        }
                        linker::link(&loader, &location)?;
                        linked = true;
                    }
                    Begin::InFlight { owner, done } => {
                        if let Some(outcome) = loader.in_flight(&location, &chain, &request, owner) {
                            return outcome;
                        }
                        let notified = done.notified();
                        if loader.registry.state(&location) != Some(ModuleState::Evaluating) {
                            continue;
                        }
                        if !loader.registry.try_wait(chain.task, &location) {
                            debug!("Reading partially evaluated {} to avoid deadlock", location);
                            return loader.partial(&location);
                        }
                        let _mark = WaitMark {
                            registry: &loader.registry,
                            task: chain.task,
                        };
                        trace!("Task {} waiting for {}", chain.task, location);
                        notified.await;
                    }
                }
            }

            let mut guard = EvaluationGuard {
                registry: loader.registry.clone(),
                location: location.clone(),
                armed: true,
            };
            let result = loader.run(&location, chain.push(location.clone())).await;
            guard.armed = false;
            loader.registry.finish_evaluation(&location, &result);
            result?;
            loader.partial(&location)
        }
        .boxed()
    }

    /// Outcome for a request that finds its target mid-evaluation, or
    /// `None` when the request should wait for completion
    fn in_flight(
        &self,
        location: &ModuleLocation,
        chain: &EvalChain,
        request: &Request,
        owner: TaskId,
    ) -> Option<Result<Namespace>> {
        let format = self.registry.get(location)?.format;
        let on_chain = chain.contains(location) || owner == chain.task;

        match (format, request) {
            (ModuleFormat::Legacy, Request::Require(_)) => Some(self.partial(location)),
            (ModuleFormat::Legacy, Request::Static(importer)) if on_chain => {
                Some(Err(LoadError::RequireCycleModule {
                    requester: importer.clone(),
                    target: location.clone(),
                }))
            }
            (ModuleFormat::Declarative, Request::Require(requester)) => Some(Err(if on_chain {
                LoadError::RequireCycleModule {
                    requester: requester.clone(),
                    target: location.clone(),
                }
            } else {
                LoadError::SynchronousBridgeViolation {
                    module: location.clone(),
                    reason: "module is being evaluated by another task".to_string(),
                }
            })),
            _ if on_chain => Some(self.partial(location)),
            _ => None,
        }
    }

    /// Namespace of a record, whatever its evaluation progress
    fn partial(&self, location: &ModuleLocation) -> Result<Namespace> {
        self.registry
            .namespace(location)
            .ok_or_else(|| LoadError::EvaluationAbandoned {
                module: location.clone(),
            })
    }

    async fn run(self: &Arc<Self>, location: &ModuleLocation, chain: EvalChain) -> Result<()> {
        let env = self
            .registry
            .environment(location)
            .ok_or_else(|| LoadError::EvaluationAbandoned {
                module: location.clone(),
            })?;

        match env.format() {
            ModuleFormat::Declarative => {
                let dependencies = self.registry.dependencies(location);
                for dependency in dependencies.iter().filter(|d| d.mode == ResolutionMode::Static) {
                    self.evaluate(
                        dependency.location.clone(),
                        chain.clone(),
                        Request::Static(location.clone()),
                    )
                    .await?;
                }
                self.run_body(env, chain).await
            }
            ModuleFormat::Legacy => {
                if location.extension() == Some("json") {
                    let text = self
                        .fs
                        .read_to_string(location.path())
                        .map_err(|e| LoadError::io(location.path(), e))?;
                    let json: serde_json::Value =
                        serde_json::from_str(&text).map_err(|e| LoadError::EvaluationError {
                            module: location.clone(),
                            message: e.to_string(),
                        })?;
                    env.set_module_exports(Value::from_json(&json));
                } else {
                    match self.run_body(env.clone(), chain).now_or_never() {
                        Some(result) => result?,
                        None => {
                            return Err(LoadError::SynchronousBridgeViolation {
                                module: location.clone(),
                                reason: "legacy module bodies cannot suspend".to_string(),
                            })
                        }
                    }
                }
                env.snapshot();
                Ok(())
            }
        }
    }

    fn run_body(self: &Arc<Self>, env: Arc<ModuleEnvironment>, chain: EvalChain) -> BoxFuture<'static, Result<()>> {
        let Some(body) = self.bodies.body_for(env.module()) else {
            trace!("No body for {}", env.module());
            return future::ready(Ok(())).boxed();
        };
        let cx = EvalContext {
            loader: Arc::clone(self),
            env,
            chain,
        };
        Timeline {
            loader: Arc::clone(self),
            body: async move { body.evaluate(cx).await }.boxed(),
        }
        .boxed()
    }
}

/// What a module body sees while it runs
#[derive(Clone)]
pub struct EvalContext {
    loader: Arc<LoaderInner>,
    env: Arc<ModuleEnvironment>,
    chain: EvalChain,
}

impl EvalContext {
    /// Location of the running module
    pub fn module(&self) -> &ModuleLocation {
        self.env.module()
    }

    pub fn format(&self) -> ModuleFormat {
        self.env.format()
    }

    /// `__filename` / `import.meta.filename`
    pub fn filename(&self) -> &Path {
        self.module().path()
    }

    /// `__dirname` / `import.meta.dirname`
    pub fn dirname(&self) -> &Path {
        self.module().dir()
    }

    /// `import.meta.url`
    pub fn url(&self) -> String {
        self.module().url()
    }

    /// `require.main === module` / `import.meta.main`
    pub fn is_main(&self) -> bool {
        self.loader.main.lock().as_ref() == Some(self.module())
    }

    /// The `exports` object the module started with
    pub fn exports(&self) -> ObjectRef {
        self.env.exports_object().clone()
    }

    /// Current `module.exports`
    pub fn module_exports(&self) -> Value {
        self.env.module_exports()
    }

    /// Replace `module.exports`
    pub fn set_module_exports(&self, value: impl Into<Value>) {
        self.env.set_module_exports(value.into());
    }

    /// Write an export: a live binding for declarative modules, a property
    /// of `module.exports` for legacy ones
    pub fn export(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.env.write_export(name, value.into())
    }

    /// Blocking request for another module
    pub fn require(&self, specifier: &str) -> Result<Value> {
        bridge::require(&self.loader, &self.chain, self.module(), specifier)
    }

    /// Current value of a statically imported binding
    pub fn import_binding(&self, local: &str) -> Result<Value> {
        let binding = self
            .env
            .imported(local)
            .ok_or_else(|| self.throw(format!("'{}' is not imported", local)))?;
        binding.get().ok_or_else(|| LoadError::UninitializedBinding {
            name: local.to_string(),
            module: self.module().clone(),
        })
    }

    /// Namespace bound by `import * as local`
    pub fn namespace(&self, local: &str) -> Result<Namespace> {
        match self.import_binding(local)? {
            Value::Namespace(namespace) => Ok(namespace),
            other => Err(self.throw(format!("'{}' is not a namespace ({})", local, other))),
        }
    }

    /// Asynchronous dynamic request (`import()`)
    pub async fn import(&self, specifier: &str) -> Result<Namespace> {
        let loader = &self.loader;
        let target = loader
            .resolver
            .resolve(specifier, self.module(), ResolutionMode::DynamicAsync)?;
        loader.registry.add_dependency(
            self.module(),
            Dependency {
                specifier: specifier.to_string(),
                location: target.clone(),
                mode: ResolutionMode::DynamicAsync,
                deferred: true,
            },
        );
        linker::link(loader, &target)?;

        // The importing task is blocked on the new task until it completes.
        let _mark = loader
            .registry
            .try_wait(self.chain.task(), &target)
            .then(|| WaitMark {
                registry: &loader.registry,
                task: self.chain.task(),
            });
        let chain = EvalChain::root(loader.next_task());
        loader.evaluate(target, chain, Request::Dynamic).await
    }

    /// Build an evaluation error for this module
    pub fn throw(&self, message: impl Into<String>) -> LoadError {
        LoadError::EvaluationError {
            module: self.module().clone(),
            message: message.into(),
        }
    }
}

impl fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("module", self.module())
            .field("task", &self.chain.task())
            .finish()
    }
}
