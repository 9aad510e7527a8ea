//! Host-provided module bodies

use crate::loader::EvalContext;
use crate::location::ModuleLocation;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Executable code of one module
#[async_trait]
pub trait ModuleBody: Send + Sync {
    /// Run the module's top-level code.
    ///
    /// Legacy bodies must complete without suspending; declarative bodies
    /// may await (dynamic imports or any other host future).
    async fn evaluate(&self, cx: EvalContext) -> Result<()>;
}

/// Looks up the body for a module location
pub trait BodyHost: Send + Sync {
    /// Body for `location`; `None` evaluates the module as empty
    fn body_for(&self, location: &ModuleLocation) -> Option<Arc<dyn ModuleBody>>;
}

struct SyncBody<F>(F);

#[async_trait]
impl<F> ModuleBody for SyncBody<F>
where
    F: Fn(&EvalContext) -> Result<()> + Send + Sync,
{
    async fn evaluate(&self, cx: EvalContext) -> Result<()> {
        (self.0)(&cx)
    }
}

/// Body from a synchronous closure
pub fn sync_body<F>(body: F) -> Arc<dyn ModuleBody>
where
    F: Fn(&EvalContext) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(SyncBody(body))
}

struct AsyncBody<F>(F);

#[async_trait]
impl<F, Fut> ModuleBody for AsyncBody<F>
where
    F: Fn(EvalContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn evaluate(&self, cx: EvalContext) -> Result<()> {
        (self.0)(cx).await
    }
}

/// Body from an asynchronous closure
pub fn async_body<F, Fut>(body: F) -> Arc<dyn ModuleBody>
where
    F: Fn(EvalContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(AsyncBody(body))
}

/// Bodies keyed by module path
#[derive(Clone, Default)]
pub struct BodyTable {
    bodies: Arc<RwLock<FxHashMap<ModuleLocation, Arc<dyn ModuleBody>>>>,
}

impl BodyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body for a path
    pub fn insert(&self, path: impl AsRef<Path>, body: Arc<dyn ModuleBody>) {
        self.bodies.write().insert(ModuleLocation::new(path), body);
    }

    /// Builder-style insert
    pub fn with(self, path: impl AsRef<Path>, body: Arc<dyn ModuleBody>) -> Self {
        self.insert(path, body);
        self
    }

    pub fn len(&self) -> usize {
        self.bodies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.read().is_empty()
    }
}

impl BodyHost for BodyTable {
    fn body_for(&self, location: &ModuleLocation) -> Option<Arc<dyn ModuleBody>> {
        self.bodies.read().get(location).cloned()
    }
}

impl fmt::Debug for BodyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.bodies.read().keys().map(|l| l.to_string()).collect();
        paths.sort();
        f.debug_struct("BodyTable").field("modules", &paths).finish()
    }
}
