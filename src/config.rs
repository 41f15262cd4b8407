//! Configuration for the dispatch service
//!
//! CLI arguments with environment variable fallbacks. Pool thresholds live in
//! [`PoolConfig`](crate::db::schemas::PoolConfig) and are managed at runtime.

use clap::Parser;
use std::time::Duration;

use crate::cli::Command;
use crate::db::schemas::ProviderKind;
use crate::dispatch::Environment;

/// Chip dispatch - outbound chip pool orchestration and dispatch
#[derive(Parser, Debug, Clone)]
#[command(name = "chip-dispatch")]
#[command(about = "Outbound chip pool orchestration, admission control and dispatch")]
pub struct Args {
    /// Deployment environment; non-production sends only to the allowlist
    #[arg(long, env = "ENVIRONMENT", value_enum, default_value = "development")]
    pub environment: Environment,

    /// Comma-separated destinations reachable outside production
    #[arg(long, env = "ALLOWLIST", value_delimiter = ',')]
    pub allowlist: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Seconds between orchestrator cycles
    #[arg(long, env = "ORCHESTRATOR_INTERVAL_SECS", default_value = "60")]
    pub orchestrator_interval_secs: u64,

    /// Seconds between health passes
    #[arg(long, env = "HEALTH_INTERVAL_SECS", default_value = "60")]
    pub health_interval_secs: u64,

    /// Seconds between touch reconciliation passes
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value = "300")]
    pub reconcile_interval_secs: u64,

    /// Orchestrator lock lease in seconds
    #[arg(long, env = "LOCK_LEASE_SECS", default_value = "300")]
    pub lock_lease_secs: u64,

    /// Content dedup window in seconds
    #[arg(long, env = "DEDUP_WINDOW_SECS", default_value = "86400")]
    pub dedup_window_secs: u64,

    /// Seconds between sweeps of expired dedup and reservation counters
    #[arg(long, env = "RESERVOIR_PURGE_SECS", default_value = "300")]
    pub reservoir_purge_secs: u64,

    /// Webhook receiving alert notifications (logs only when unset)
    #[arg(long, env = "NOTIFY_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Log sends instead of delivering them
    #[arg(long, env = "DRY_RUN", default_value = "true")]
    pub dry_run: bool,

    /// Comma-separated phone numbers available to auto-provisioning
    #[arg(long, env = "PROVISION_INVENTORY", value_delimiter = ',')]
    pub provision_inventory: Vec<String>,

    /// Provider assigned to provisioned identities
    #[arg(long, env = "PROVISION_PROVIDER", value_enum, default_value = "web-session")]
    pub provision_provider: ProviderKind,

    /// Operation to run (defaults to serve)
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Args {
    pub fn orchestrator_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn reservoir_purge_interval(&self) -> Duration {
        Duration::from_secs(self.reservoir_purge_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dry_run {
            return Err(
                "DRY_RUN=false requires a provider sender, none is built into this binary"
                    .to_string(),
            );
        }

        for (name, secs) in [
            ("ORCHESTRATOR_INTERVAL_SECS", self.orchestrator_interval_secs),
            ("HEALTH_INTERVAL_SECS", self.health_interval_secs),
            ("RECONCILE_INTERVAL_SECS", self.reconcile_interval_secs),
            ("DEDUP_WINDOW_SECS", self.dedup_window_secs),
            ("RESERVOIR_PURGE_SECS", self.reservoir_purge_secs),
        ] {
            if secs == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        // A lease shorter than a cycle lets a second instance take over mid-cycle
        if self.lock_lease_secs < self.orchestrator_interval_secs {
            return Err(
                "LOCK_LEASE_SECS must be at least ORCHESTRATOR_INTERVAL_SECS".to_string(),
            );
        }

        if let Some(url) = &self.webhook_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("NOTIFY_WEBHOOK_URL must be an http(s) URL".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["chip-dispatch"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_defaults_validate() {
        let args = parse(&[]);
        assert_eq!(args.environment, Environment::Development);
        assert!(args.allowlist.is_empty());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_lists_and_enums() {
        let args = parse(&[
            "--environment",
            "staging",
            "--allowlist",
            "+15550001,+15550002",
            "--provision-provider",
            "cloud-api",
        ]);
        assert_eq!(args.environment, Environment::Staging);
        assert_eq!(args.allowlist.len(), 2);
        assert_eq!(args.provision_provider, ProviderKind::CloudApi);
    }

    #[test]
    fn test_subcommand_parsed() {
        assert!(parse(&[]).command.is_none());
        assert!(matches!(parse(&["status"]).command, Some(Command::Status)));
        assert!(parse(&["--reservoir-purge-secs", "0"]).validate().is_err());
    }

    #[test]
    fn test_short_lease_rejected() {
        let args = parse(&["--lock-lease-secs", "30"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_bad_webhook_rejected() {
        let args = parse(&["--webhook-url", "ftp://alerts"]);
        assert!(args.validate().is_err());
    }
}
