use clap::Parser;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainRecord;
use crate::time::{DefaultTime, Time};

// default values
const DEFAULT_POLL_INTERVAL: u64 = 5;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_MAX_DELAY: u64 = 1;
const DEFAULT_CLOSE_TIMEOUT: u64 = 10;
const DEFAULT_MAX_IN_FLIGHT: usize = 1;
const DEFAULT_CONFIRMATIONS: u64 = 1;

const DEFAULT_FALLBACK_GAS_PRICE: u64 = 20_000_000_000; // 20 gwei
const DEFAULT_GAS_LIMIT_MULTIPLIER: f64 = 1.0;
const DEFAULT_GAS_LIMIT_TRANSFER: u64 = 21_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("command line: {0}")]
    Cli(#[from] clap::Error),

    #[error("could not read configuration file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[error("could not parse configuration file {path}: {source}")]
    ParseFile {
        path: String,
        source: serde_json::Error,
    },

    #[error("invalid configuration for chain {chain_id}: {reason}")]
    InvalidChain { chain_id: String, reason: String },

    #[error("invalid transaction manager configuration: {0}")]
    InvalidTxm(String),
}

#[derive(Parser, Debug)]
#[command(
    name = "txm_config",
    about = "Configuration for the chain transaction manager"
)]
struct TxmEnvCLIConfig {
    /// Path to the transaction manager config file
    #[arg(long, env)]
    pub txm_config: Option<String>,
    /// Interval (secs) between two scans of the submission and confirmation loops
    #[arg(long, env)]
    pub txm_poll_interval: Option<u64>,
    /// Max retries of a transient broadcast failure
    #[arg(long, env)]
    pub txm_max_retries: Option<u32>,
    /// Base delay (secs) of the exponential backoff between retries
    #[arg(long, env)]
    pub txm_max_delay: Option<u64>,
    /// Grace period (secs) given to the loops when closing
    #[arg(long, env)]
    pub txm_close_timeout: Option<u64>,
    /// Max broadcast-but-unconfirmed transactions per account
    #[arg(long, env)]
    pub txm_max_in_flight: Option<usize>,
    /// Blocks of depth required to consider a transaction final
    #[arg(long, env)]
    pub txm_confirmations: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TxmFileConfig {
    pub txm_poll_interval: Option<u64>,
    pub txm_max_retries: Option<u32>,
    pub txm_max_delay: Option<u64>,
    pub txm_close_timeout: Option<u64>,
    pub txm_max_in_flight: Option<usize>,
    pub txm_confirmations: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TxmConfig {
    /// Interval between two scans of the submission and confirmation loops.
    pub poll_interval: Duration,

    /// Attempts made after a transient broadcast failure before giving up.
    pub max_retries: u32,

    /// Base delay of the backoff between two broadcast attempts.
    pub max_delay: Duration,

    /// Time `close` waits for the loops before aborting them.
    pub close_timeout: Duration,

    pub max_in_flight: usize,
    pub confirmations: u64,

    /// Dependency that handles sleeping between retries.
    pub time: Arc<dyn Time>,
}

impl TxmConfig {
    /// Reads the process arguments and environment.
    pub fn initialize() -> Result<Self, ConfigError> {
        Self::initialize_from(std::env::args_os())
    }

    /// Precedence: command line / environment, then config file, then
    /// defaults.
    pub fn initialize_from<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let env_cli_config = TxmEnvCLIConfig::try_parse_from(args)?;

        let file_config: TxmFileConfig = match env_cli_config.txm_config {
            Some(ref path) => load_config_file(path)?,
            None => TxmFileConfig::default(),
        };

        let poll_interval = Duration::from_secs(
            env_cli_config
                .txm_poll_interval
                .or(file_config.txm_poll_interval)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        );

        let max_retries = env_cli_config
            .txm_max_retries
            .or(file_config.txm_max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let max_delay = Duration::from_secs(
            env_cli_config
                .txm_max_delay
                .or(file_config.txm_max_delay)
                .unwrap_or(DEFAULT_MAX_DELAY),
        );

        let close_timeout = Duration::from_secs(
            env_cli_config
                .txm_close_timeout
                .or(file_config.txm_close_timeout)
                .unwrap_or(DEFAULT_CLOSE_TIMEOUT),
        );

        let max_in_flight = env_cli_config
            .txm_max_in_flight
            .or(file_config.txm_max_in_flight)
            .unwrap_or(DEFAULT_MAX_IN_FLIGHT);

        let confirmations = env_cli_config
            .txm_confirmations
            .or(file_config.txm_confirmations)
            .unwrap_or(DEFAULT_CONFIRMATIONS);

        let config = TxmConfig {
            poll_interval,
            max_retries,
            max_delay,
            close_timeout,
            max_in_flight,
            confirmations,
            time: Arc::new(DefaultTime),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidTxm("poll interval must be positive".into()));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidTxm("max in flight must be positive".into()));
        }
        Ok(())
    }

    pub fn set_poll_interval(mut self, poll_interval: Duration) -> TxmConfig {
        self.poll_interval = poll_interval;
        self
    }

    pub fn set_max_retries(mut self, max_retries: u32) -> TxmConfig {
        self.max_retries = max_retries;
        self
    }

    pub fn set_close_timeout(mut self, close_timeout: Duration) -> TxmConfig {
        self.close_timeout = close_timeout;
        self
    }

    pub fn set_max_in_flight(mut self, max_in_flight: usize) -> TxmConfig {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn set_time(mut self, time: Arc<dyn Time>) -> TxmConfig {
        self.time = time;
        self
    }
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL),
            max_retries: DEFAULT_MAX_RETRIES,
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY),
            close_timeout: Duration::from_secs(DEFAULT_CLOSE_TIMEOUT),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            confirmations: DEFAULT_CONFIRMATIONS,
            time: Arc::new(DefaultTime),
        }
    }
}

/// Gas policy of one chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainCfg {
    /// Price (wei) used when live estimation is unavailable or returns zero.
    pub fallback_gas_price: U256,

    /// Safety factor applied to every gas limit.
    pub gas_limit_multiplier: f64,

    /// Gas limit of a plain value transfer.
    pub gas_limit_transfer: u64,
}

impl ChainCfg {
    pub fn validate(&self, chain_id: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidChain {
            chain_id: chain_id.to_string(),
            reason,
        };

        if !self.gas_limit_multiplier.is_finite() || self.gas_limit_multiplier < 1.0 {
            return Err(invalid(format!(
                "gas limit multiplier must be a finite number >= 1, got {}",
                self.gas_limit_multiplier
            )));
        }
        if self.gas_limit_transfer == 0 {
            return Err(invalid("transfer gas limit must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for ChainCfg {
    fn default() -> Self {
        Self {
            fallback_gas_price: U256::from(DEFAULT_FALLBACK_GAS_PRICE),
            gas_limit_multiplier: DEFAULT_GAS_LIMIT_MULTIPLIER,
            gas_limit_transfer: DEFAULT_GAS_LIMIT_TRANSFER,
        }
    }
}

/// Persisted chain and node configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainsFile {
    pub chains: Vec<ChainRecord>,
}

impl ChainsFile {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let chains_file: ChainsFile = load_config_file(path)?;
        for chain in &chains_file.chains {
            chain.cfg.validate(&chain.id)?;
        }
        Ok(chains_file)
    }
}

fn load_config_file<T>(path: &str) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    let s = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_str(&s).map_err(|source| ConfigError::ParseFile {
        path: path.to_string(),
        source,
    })
}
