//! imirror CLI - keeps a dated, per-architecture mirror of middleware images.

pub mod commands;
pub mod logging;
pub mod output;
