use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::{str::FromStr, time::Duration};
use srvpool::PoolConfig;
use std::collections::HashSet;

/// Runtime configuration for the `srvpool-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a single local
/// listener.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "srvpool-server",
    version,
    about = "Runs a pool of TCP listeners with bounded restart and shutdown"
)]
pub struct CliArgs {
    /// Servers to run, as `NAME=BIND[=EXPOSE]`.
    ///
    /// Repeat the flag or separate entries with commas. `EXPOSE` is the
    /// externally advertised address and defaults to `BIND`.
    ///
    /// Example: `api=0.0.0.0:9001=api.example.com:443,admin=127.0.0.1:9002`
    ///
    /// Environment variable: `SERVERS`
    #[arg(
        long = "server",
        env = "SERVERS",
        value_delimiter = ',',
        default_value = "default=127.0.0.1:9001"
    )]
    pub servers: Vec<String>,

    /// Time budget, in seconds, for restarting every server (on `SIGHUP`).
    ///
    /// Servers still restarting when the budget is spent are abandoned.
    ///
    /// Environment variable: `RESTART_TIMEOUT_SECS`
    #[arg(long, env = "RESTART_TIMEOUT_SECS", default_value_t = 30)]
    pub restart_timeout_secs: u64,

    /// Time budget, in seconds, for stopping every server on termination.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Maximum servers restarted or stopped at the same time. `0` uses one
    /// per CPU.
    ///
    /// Environment variable: `POOL_CONCURRENCY`
    #[arg(long, env = "POOL_CONCURRENCY", default_value_t = 0)]
    pub concurrency: usize,

    /// Seconds a single server waits for its accept loop to stop.
    ///
    /// Environment variable: `SERVER_GRACE_SECS`
    #[arg(long, env = "SERVER_GRACE_SECS", default_value_t = 5)]
    pub grace_secs: u64,

    /// Console log layout.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-oriented output.
    Pretty,
    /// One line per event.
    Compact,
}

/// One `NAME=BIND[=EXPOSE]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub bind: String,
    pub expose: String,
}

impl FromStr for ServerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '=');
        let name = parts.next().unwrap_or_default().trim();
        let bind = parts
            .next()
            .map(str::trim)
            .with_context(|| format!("server entry {s:?} must look like NAME=BIND[=EXPOSE]"))?;
        let expose = parts.next().map(str::trim).unwrap_or(bind);

        if name.is_empty() {
            bail!("server entry {s:?} has an empty name");
        }
        if bind.is_empty() {
            bail!("server entry {s:?} has an empty bind address");
        }
        if expose.is_empty() {
            bail!("server entry {s:?} has an empty exposed address");
        }

        Ok(Self {
            name: name.to_string(),
            bind: bind.to_string(),
            expose: expose.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub servers: Vec<ServerSpec>,
    pub pool: PoolConfig,
    pub grace: Duration,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let servers = args
            .servers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<ServerSpec>())
            .collect::<anyhow::Result<Vec<_>>>()?;

        if servers.is_empty() {
            bail!("SERVERS must name at least one server");
        }

        let mut seen = HashSet::with_capacity(servers.len());
        for spec in &servers {
            if !seen.insert(spec.bind.as_str()) {
                bail!("bind address {} is used by more than one server", spec.bind);
            }
        }

        if args.restart_timeout_secs == 0 {
            bail!("RESTART_TIMEOUT_SECS must be greater than 0");
        }
        if args.shutdown_timeout_secs == 0 {
            bail!("SHUTDOWN_TIMEOUT_SECS must be greater than 0");
        }

        let pool = PoolConfig::new()
            .with_restart_timeout(Duration::from_secs(args.restart_timeout_secs))
            .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout_secs))
            .with_concurrency(args.concurrency);

        Ok(Self {
            servers,
            pool,
            grace: Duration::from_secs(args.grace_secs),
            log_format: args.log_format,
        })
    }
}
