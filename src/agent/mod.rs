//! The long-lived caching agent and its client-side bootstrap

pub mod client;
pub mod harden;
pub mod lockfile;
pub mod service;

pub use client::launch_or_connect;
pub use lockfile::Lockfile;
pub use service::{AgentConfig, AgentHandle, CachingAgent};
