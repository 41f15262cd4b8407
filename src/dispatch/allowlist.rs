//! Environment allowlist

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub use crate::db::schemas::normalize_destination;

/// Destinations reachable outside production.
///
/// Fails closed: outside production an empty list permits nothing.
#[derive(Debug, Clone)]
pub struct Allowlist {
    environment: Environment,
    entries: HashSet<String>,
}

impl Allowlist {
    pub fn new<I, S>(environment: Environment, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            environment,
            entries: entries
                .into_iter()
                .map(|e| normalize_destination(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn permits(&self, destination: &str) -> bool {
        if self.environment == Environment::Production {
            return true;
        }
        let normalized = normalize_destination(destination);
        !normalized.is_empty() && self.entries.contains(&normalized)
    }
}
