//! CLI command implementations

pub mod agent;
pub mod get;
pub mod setup;

pub use agent::{launch as agent_launch, logs as agent_logs, prune as agent_prune};
pub use agent::{raw as agent_raw, shutdown as agent_shutdown};
pub use get::execute as get;
pub use setup::execute as setup_uri;
