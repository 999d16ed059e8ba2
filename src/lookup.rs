//! Ordered secret lookup
//!
//! Helpers never read secrets directly. They declare *bindings* (well-known
//! names like `default` or `secret_access_key`) and resolve them through a
//! lookup chain: an ordered list of sources, each of which either yields the
//! secret, reports "not here", or fails hard. The chain is part of each
//! helper's config fragment, so users can reorder or replace sources per
//! URL rule.

use crate::error::{CharonError, CharonResult};
use serde::Deserialize;

fn default_binding() -> String {
    "default".to_string()
}

/// A single secret source. Closed set.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase", deny_unknown_fields)]
pub enum Source {
    /// Read an environment variable
    Env {
        name: String,
        #[serde(default = "default_binding")]
        binding: String,
    },
    /// Read the OS keyring
    Keyring {
        service: String,
        #[serde(default = "default_binding")]
        binding: String,
    },
    /// A literal value embedded in the config file
    Static {
        value: String,
        #[serde(default = "default_binding")]
        binding: String,
    },
}

impl Source {
    fn binding(&self) -> &str {
        match self {
            Self::Env { binding, .. }
            | Self::Keyring { binding, .. }
            | Self::Static { binding, .. } => binding,
        }
    }

    /// `Ok(None)` means this source has nothing for the binding; hard
    /// failures (e.g. a locked keyring) are surfaced as errors.
    fn lookup(&self, binding: &str) -> CharonResult<Option<String>> {
        if self.binding() != binding {
            return Ok(None);
        }
        match self {
            Self::Env { name, .. } => Ok(std::env::var(name).ok()),
            Self::Keyring { service, .. } => {
                let entry = keyring::Entry::new(service, binding).map_err(|e| {
                    CharonError::Lookup {
                        binding: binding.to_string(),
                        reason: format!("opening keyring entry {service}: {e}"),
                    }
                })?;
                match entry.get_password() {
                    Ok(secret) => Ok(Some(secret)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => Err(CharonError::Lookup {
                        binding: binding.to_string(),
                        reason: format!("reading keyring entry {service}: {e}"),
                    }),
                }
            }
            Self::Static { value, .. } => Ok(Some(value.clone())),
        }
    }

    fn setup_instruction(&self, binding: &str) -> Option<String> {
        if self.binding() != binding {
            return None;
        }
        Some(match self {
            Self::Env { name, .. } => {
                let status = if std::env::var(name).is_ok() {
                    "SET"
                } else {
                    "NOT SET"
                };
                format!("  - export the environment variable {name} (currently {status})")
            }
            Self::Keyring { service, .. } => format!(
                "  - store the secret in the OS keyring under service {service:?}, user {binding:?}"
            ),
            Self::Static { .. } => {
                "  - a static value is embedded in the workspace config file".to_string()
            }
        })
    }
}

/// An ordered list of sources. The first source that yields a value wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct LookupChain {
    sources: Vec<Source>,
}

impl LookupChain {
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Look up a binding. `Ok(None)` means no source had a value; an error
    /// means at least one source failed hard and none succeeded.
    pub fn lookup(&self, binding: &str) -> CharonResult<Option<String>> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.lookup(binding) {
                Ok(Some(secret)) => return Ok(Some(secret)),
                Ok(None) => continue,
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(None)
        } else {
            Err(CharonError::Lookup {
                binding: binding.to_string(),
                reason: failures.join("; "),
            })
        }
    }

    /// Human-readable setup steps for a binding, used by `setup-uri`.
    pub fn setup_instructions(&self, binding: &str, meaning: &str) -> String {
        let steps: Vec<String> = self
            .sources
            .iter()
            .filter_map(|s| s.setup_instruction(binding))
            .collect();
        if steps.is_empty() {
            return format!(
                "No sources are configured for the secret {binding:?} ({meaning}). \
                 Add a lookup_chain entry to the workspace config file."
            );
        }
        format!(
            "To provide the secret {binding:?} ({meaning}), use one of:\n{}",
            steps.join("\n")
        )
    }
}
