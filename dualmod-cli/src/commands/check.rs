//! Check command

use super::graph::GraphReport;
use crate::config::OutputConfig;
use anyhow::Result;
use dualmod_loader::ModuleLoader;
use std::path::Path;

pub fn check(loader: &ModuleLoader, entry: &Path, output: &OutputConfig) -> Result<()> {
    let entry = loader.link(entry)?;
    let report = GraphReport::collect(entry, loader.registry());

    if output.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for module in &report.modules {
        println!("{} [{}, {:?}]", module.location, module.format, module.state);
        if !module.exports.is_empty() {
            println!("  exports: {}", module.exports.join(", "));
        }
    }

    if output.show_cycles && !report.cycles.is_empty() {
        println!("cycles:");
        for edge in &report.cycles {
            let deferred = if edge.deferred { ", deferred" } else { "" };
            println!("  {} -> {} [{}{}]", edge.from, edge.to, edge.mode, deferred);
        }
    }
    println!("{} module(s) linked", report.modules.len());
    Ok(())
}
