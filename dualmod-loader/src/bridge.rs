//! Synchronous bridge
//!
//! `require` must produce a value without suspending. Legacy targets run
//! inline; declarative targets are admitted only when their whole static
//! subgraph can complete in one poll.

use crate::linker;
use crate::loader::{EvalChain, LoaderInner, Request};
use crate::location::{ModuleFormat, ModuleLocation, ResolutionMode};
use crate::namespace::Namespace;
use crate::registry::{Dependency, ModuleState};
use crate::value::Value;
use crate::{LoadError, Result};
use futures::FutureExt;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Name a declarative module exports to choose its `require` result
const MODULE_EXPORTS: &str = "module.exports";

/// `require(specifier)` issued by `requester`
pub(crate) fn require(
    loader: &Arc<LoaderInner>,
    chain: &EvalChain,
    requester: &ModuleLocation,
    specifier: &str,
) -> Result<Value> {
    let location = loader
        .resolver
        .resolve(specifier, requester, ResolutionMode::DynamicSync)?;
    trace!("require('{}') from {} -> {}", specifier, requester, location);

    let recorded = loader
        .registry
        .dependencies(requester)
        .iter()
        .any(|dependency| dependency.location == location);
    if !recorded {
        loader.registry.add_dependency(
            requester,
            Dependency {
                specifier: specifier.to_string(),
                location: location.clone(),
                mode: ResolutionMode::DynamicSync,
                deferred: false,
            },
        );
    }
    linker::link(loader, &location)?;

    match format_of(loader, &location)? {
        ModuleFormat::Legacy => {
            evaluate_sync(loader, &location, chain, Request::Require(requester.clone()))?;
            loader
                .registry
                .environment(&location)
                .map(|env| env.module_exports())
                .ok_or(LoadError::EvaluationAbandoned { module: location })
        }
        ModuleFormat::Declarative => {
            check_subgraph(loader, &location, chain, Some(requester))?;
            let namespace =
                evaluate_sync(loader, &location, chain, Request::Require(requester.clone()))?;
            match namespace.get(MODULE_EXPORTS) {
                Ok(value) => Ok(value),
                Err(LoadError::NamedExportNotFound { .. }) => Ok(Value::Namespace(namespace)),
                Err(error) => Err(error),
            }
        }
    }
}

/// Evaluate a linked entry without suspending
pub(crate) fn load_sync(
    loader: &Arc<LoaderInner>,
    location: &ModuleLocation,
    chain: &EvalChain,
) -> Result<Namespace> {
    if format_of(loader, location)? == ModuleFormat::Declarative {
        check_subgraph(loader, location, chain, None)?;
    }
    evaluate_sync(loader, location, chain, Request::Entry)
}

fn format_of(loader: &LoaderInner, location: &ModuleLocation) -> Result<ModuleFormat> {
    match loader.registry.get(location) {
        Some(record) => Ok(record.format),
        None => loader.classifier.classify(location),
    }
}

/// Reject a synchronous request before anything runs if some module of the
/// static subgraph could only finish asynchronously
fn check_subgraph(
    loader: &LoaderInner,
    target: &ModuleLocation,
    chain: &EvalChain,
    requester: Option<&ModuleLocation>,
) -> Result<()> {
    let mut stack = vec![target.clone()];
    let mut seen = FxHashSet::default();

    while let Some(current) = stack.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        let Some(record) = loader.registry.get(&current) else {
            continue;
        };

        match record.state {
            ModuleState::Evaluated => continue,
            ModuleState::Errored => {
                return Err(record.error.unwrap_or(LoadError::EvaluationAbandoned { module: current }))
            }
            ModuleState::Evaluating | ModuleState::Linking => {
                let on_chain = chain.contains(&current);
                match requester {
                    Some(requester) if on_chain => {
                        debug!("require of {} reaches {} mid-evaluation", target, current);
                        return Err(LoadError::RequireCycleModule {
                            requester: requester.clone(),
                            target: current,
                        });
                    }
                    _ if !on_chain && record.format == ModuleFormat::Declarative => {
                        return Err(LoadError::SynchronousBridgeViolation {
                            module: current,
                            reason: "module is being evaluated by another task".to_string(),
                        });
                    }
                    _ => continue,
                }
            }
            ModuleState::Unlinked | ModuleState::Linked => {
                if record.format == ModuleFormat::Declarative && record.top_level_await {
                    return Err(LoadError::SynchronousBridgeViolation {
                        module: current,
                        reason: "module uses top-level await".to_string(),
                    });
                }
            }
        }

        if record.format == ModuleFormat::Declarative {
            stack.extend(
                record
                    .dependencies
                    .iter()
                    .filter(|dependency| dependency.mode == ResolutionMode::Static)
                    .map(|dependency| dependency.location.clone()),
            );
        }
    }
    Ok(())
}

/// Poll an evaluation exactly once
fn evaluate_sync(
    loader: &Arc<LoaderInner>,
    location: &ModuleLocation,
    chain: &EvalChain,
    request: Request,
) -> Result<Namespace> {
    loader
        .evaluate(location.clone(), chain.clone(), request)
        .now_or_never()
        .unwrap_or_else(|| {
            warn!("Synchronous evaluation of {} suspended", location);
            Err(LoadError::SynchronousBridgeViolation {
                module: location.clone(),
                reason: "evaluation suspended before completing".to_string(),
            })
        })
}
