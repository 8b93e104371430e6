use alloy_primitives::Address;
use anyhow::{anyhow, bail, Context};
use dotenvy::dotenv;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::chain::types::LogFilter;
use crate::processor::decoder::TRANSFER_EVENT_SIG;
use crate::scanner::step::StepBounds;

/// Default chain identifier
const DEFAULT_CHAIN: &str = "ethereum";

/// Default safe depth below head
const DEFAULT_CONFIRMATIONS: u64 = 12;

/// Default scanner tick period in milliseconds
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;

/// Default processor tick period in milliseconds
const DEFAULT_POLL_PROCESS_INTERVAL_MS: u64 = 2_000;

/// Default number of cursor markers checked for reorgs
const DEFAULT_REORG_CHECK_DEPTH: u32 = 100;

const DEFAULT_REORG_RECHECK_TICKS: u64 = 100;

const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

const DEFAULT_BATCH_PROCESS_SIZE: u32 = 100;

const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// Scanner loop settings
#[derive(Debug, Clone)]
pub(crate) struct ScannerSettings {
    pub(crate) chain: String,
    /// Blocks below head considered final
    pub(crate) confirmations: u64,
    pub(crate) step: StepBounds,
    pub(crate) poll_interval: Duration,
    /// Number of newest cursor markers verified by the reorg detector
    pub(crate) reorg_check_depth: u32,
    /// Re-run the reorg detector every this many ticks (0 = startup only)
    pub(crate) reorg_recheck_ticks: u64,
    /// Failed ticks in a row that trigger a reorg re-check (0 = never)
    pub(crate) max_consecutive_failures: u32,
    pub(crate) log_filter: LogFilter,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            chain: DEFAULT_CHAIN.to_string(),
            confirmations: DEFAULT_CONFIRMATIONS,
            step: StepBounds::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reorg_check_depth: DEFAULT_REORG_CHECK_DEPTH,
            reorg_recheck_ticks: DEFAULT_REORG_RECHECK_TICKS,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            log_filter: LogFilter::default(),
        }
    }
}

/// Processor loop settings
#[derive(Debug, Clone)]
pub(crate) struct ProcessorSettings {
    pub(crate) chain: String,
    pub(crate) poll_interval: Duration,
    pub(crate) batch_size: u32,
    /// Events processed concurrently within one batch
    pub(crate) workers: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            chain: DEFAULT_CHAIN.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_PROCESS_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_PROCESS_SIZE,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct IngestConfig {
    /// EVM JSON-RPC endpoint
    rpc_url: String,

    /// SQLite connection string
    database_dsn: String,

    /// Deadline of every JSON-RPC request
    rpc_timeout: Duration,

    scanner: ScannerSettings,

    processor: ProcessorSettings,
}

impl IngestConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source.
    pub(crate) fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rpc_url = var("RPC_URL").ok_or_else(|| anyhow!("RPC_URL is required"))?;
        let database_dsn =
            var("DATABASE_DSN").ok_or_else(|| anyhow!("DATABASE_DSN is required"))?;
        let chain = var("CHAIN").unwrap_or_else(|| DEFAULT_CHAIN.to_string());

        let defaults = StepBounds::default();
        let step = StepBounds {
            initial_step: parse_or(&var, "INITIAL_STEP", defaults.initial_step)?,
            min_step: parse_or(&var, "MIN_STEP", defaults.min_step)?,
            max_step: parse_or(&var, "MAX_STEP", defaults.max_step)?,
            success_threshold: parse_or(&var, "SUCCESS_THRESHOLD", defaults.success_threshold)?,
            failure_threshold: parse_or(&var, "FAILURE_THRESHOLD", defaults.failure_threshold)?,
        };
        step.validate().map_err(|e| anyhow!(e))?;

        let mut log_filter = LogFilter::default();
        if let Some(list) = var("TOKEN_CONTRACTS") {
            for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let address = Address::from_str(raw)
                    .with_context(|| format!("TOKEN_CONTRACTS entry {raw:?} is not an address"))?;
                log_filter.addresses.push(address);
            }
        }
        if parse_or(&var, "TRANSFER_LOGS_ONLY", false)? {
            log_filter.topic0 = Some(*TRANSFER_EVENT_SIG);
        }

        let scanner = ScannerSettings {
            chain: chain.clone(),
            confirmations: parse_or(&var, "CONFIRMATIONS", DEFAULT_CONFIRMATIONS)?,
            step,
            poll_interval: duration_or(&var, "POLL_INTERVAL", DEFAULT_POLL_INTERVAL_MS)?,
            reorg_check_depth: parse_or(&var, "REORG_CHECK_DEPTH", DEFAULT_REORG_CHECK_DEPTH)?,
            reorg_recheck_ticks: parse_or(&var, "REORG_RECHECK_TICKS", DEFAULT_REORG_RECHECK_TICKS)?,
            max_consecutive_failures: parse_or(
                &var,
                "MAX_CONSECUTIVE_FAILURES",
                DEFAULT_MAX_CONSECUTIVE_FAILURES,
            )?,
            log_filter,
        };
        if scanner.reorg_check_depth == 0 {
            bail!("REORG_CHECK_DEPTH must be at least 1");
        }

        let processor = ProcessorSettings {
            chain,
            poll_interval: duration_or(
                &var,
                "POLL_PROCESS_INTERVAL",
                DEFAULT_POLL_PROCESS_INTERVAL_MS,
            )?,
            batch_size: parse_or(&var, "BATCH_PROCESS_SIZE", DEFAULT_BATCH_PROCESS_SIZE)?,
            workers: parse_or(&var, "PROCESS_WORKERS", 1)?,
        };
        if processor.batch_size == 0 || processor.workers == 0 {
            bail!("BATCH_PROCESS_SIZE and PROCESS_WORKERS must be at least 1");
        }

        let rpc_timeout = duration_or(&var, "RPC_TIMEOUT", DEFAULT_RPC_TIMEOUT_MS)?;

        info!(
            chain = %scanner.chain,
            confirmations = scanner.confirmations,
            initial_step = scanner.step.initial_step,
            poll_interval = ?scanner.poll_interval,
            process_interval = ?processor.poll_interval,
            batch_size = processor.batch_size,
            workers = processor.workers,
            "Loaded ingest config:"
        );

        Ok(IngestConfig {
            rpc_url,
            database_dsn,
            rpc_timeout,
            scanner,
            processor,
        })
    }

    /// Getter for `rpc_url`
    pub(crate) fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Getter for `database_dsn`
    pub(crate) fn database_dsn(&self) -> &str {
        &self.database_dsn
    }

    /// Getter for `rpc_timeout`
    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub(crate) fn scanner(&self) -> &ScannerSettings {
        &self.scanner
    }

    pub(crate) fn processor(&self) -> &ProcessorSettings {
        &self.processor
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        None => Ok(default),
    }
}

fn duration_or<F>(var: &F, key: &str, default_ms: u64) -> anyhow::Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => parse_duration(&raw).with_context(|| format!("invalid {key}={raw:?}")),
        None => Ok(Duration::from_millis(default_ms)),
    }
}

/// Accepts `1500ms`, `3s` or a bare number of seconds.
pub(crate) fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if let Some(ms) = raw.strip_suffix("ms") {
        return Ok(Duration::from_millis(ms.trim().parse()?));
    }
    let secs = raw.strip_suffix('s').unwrap_or(raw);
    Ok(Duration::from_secs(secs.trim().parse()?))
}
