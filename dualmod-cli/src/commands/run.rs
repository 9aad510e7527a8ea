//! Run command

use anyhow::Result;
use dualmod_loader::{LoadError, ModuleLoader, Namespace};
use std::path::Path;
use tracing::info;

/// Link and evaluate `entry`, optionally through the synchronous bridge
pub async fn evaluate(loader: &ModuleLoader, entry: &Path, sync: bool) -> Result<Namespace> {
    let namespace = if sync {
        loader.load_sync(entry)?
    } else {
        loader.load(entry).await?
    };
    info!("Evaluated {} module(s)", loader.registry().len());
    Ok(namespace)
}

pub async fn run(loader: &ModuleLoader, entry: &Path, sync: bool) -> Result<()> {
    let namespace = evaluate(loader, entry, sync).await?;

    println!("{}", namespace.module());
    for name in namespace.names() {
        match namespace.get(name) {
            Ok(value) => println!("  {} = {}", name, value),
            Err(LoadError::UninitializedBinding { .. }) => println!("  {} = <uninitialized>", name),
            Err(error) => return Err(error.into()),
        }
    }
    Ok(())
}
