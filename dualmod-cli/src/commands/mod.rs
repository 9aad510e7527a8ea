//! CLI subcommands

pub mod check;
pub mod graph;
pub mod resolve;
pub mod run;
