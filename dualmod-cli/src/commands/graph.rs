//! Graph command

use anyhow::Result;
use dualmod_loader::{
    CyclicEdge, Dependency, ModuleFormat, ModuleLoader, ModuleLocation, ModuleRegistry, ModuleState,
};
use serde::Serialize;
use std::path::Path;

/// Serializable snapshot of a linked graph
#[derive(Debug, Serialize)]
pub struct GraphReport {
    pub entry: ModuleLocation,
    pub modules: Vec<ModuleNode>,
    pub cycles: Vec<CyclicEdge>,
}

#[derive(Debug, Serialize)]
pub struct ModuleNode {
    pub location: ModuleLocation,
    pub format: ModuleFormat,
    pub state: ModuleState,
    pub exports: Vec<String>,
    pub dependencies: Vec<Dependency>,
}

impl GraphReport {
    pub fn collect(entry: ModuleLocation, registry: &ModuleRegistry) -> Self {
        let modules = registry
            .locations()
            .into_iter()
            .filter_map(|location| registry.get(&location))
            .map(|record| ModuleNode {
                exports: record
                    .namespace
                    .as_ref()
                    .map(|namespace| namespace.names().map(str::to_string).collect())
                    .unwrap_or_default(),
                location: record.location,
                format: record.format,
                state: record.state,
                dependencies: record.dependencies,
            })
            .collect();

        Self {
            entry,
            modules,
            cycles: registry.detect_cycle(),
        }
    }
}

pub fn graph(loader: &ModuleLoader, entry: &Path, json: bool) -> Result<()> {
    let entry = loader.link(entry)?;
    let report = GraphReport::collect(entry, loader.registry());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for module in &report.modules {
        println!("{} ({})", module.location, module.format);
        for dependency in &module.dependencies {
            let deferred = if dependency.deferred { ", deferred" } else { "" };
            println!(
                "  '{}' -> {} [{}{}]",
                dependency.specifier, dependency.location, dependency.mode, deferred
            );
        }
    }
    Ok(())
}
