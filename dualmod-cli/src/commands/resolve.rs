//! Resolve command

use anyhow::Result;
use clap::ValueEnum;
use dualmod_loader::{ModuleFormat, ModuleLoader, ModuleLocation, ResolutionMode};
use std::path::PathBuf;

/// Request kind as spelled on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Mode {
    /// Import declaration
    Static,
    /// `require`
    Require,
    /// `import()`
    Import,
}

impl From<Mode> for ResolutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Static => ResolutionMode::Static,
            Mode::Require => ResolutionMode::DynamicSync,
            Mode::Import => ResolutionMode::DynamicAsync,
        }
    }
}

/// Resolve `specifier` as a module in `from` (default: the current
/// directory) would, and classify the result
pub fn locate(
    loader: &ModuleLoader,
    specifier: &str,
    from: Option<PathBuf>,
    mode: Mode,
) -> Result<(ModuleLocation, ModuleFormat)> {
    let referrer = match from {
        Some(path) => loader.resolve_entry(path)?,
        // any file name works; only its directory is used
        None => ModuleLocation::new(std::env::current_dir()?.join("[cli]")),
    };

    let location = loader.resolve(specifier, &referrer, mode.into())?;
    let format = loader.classify(&location)?;
    Ok((location, format))
}

pub fn resolve(loader: &ModuleLoader, specifier: &str, from: Option<PathBuf>, mode: Mode) -> Result<()> {
    let (location, format) = locate(loader, specifier, from, mode)?;
    println!("{} ({})", location, format);
    Ok(())
}
