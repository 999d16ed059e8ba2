//! charon - local credential broker
//!
//! Answers credential-helper requests (`{"uri": ...}` on stdin, headers on
//! stdout) for build tools, with a per-workspace background agent that
//! caches responses across short-lived invocations.

pub mod agent;
pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod helpers;
pub mod locate;
pub mod logging;
pub mod lookup;

pub use error::{CharonError, CharonResult};
