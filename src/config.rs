//! Process configuration read from `BALLOT_LEDGER_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::crypto::DEFAULT_KEY_BITS;

const BIND: &str = "BALLOT_LEDGER_BIND";
const ELECTION: &str = "BALLOT_LEDGER_ELECTION";
const VOTING_COMPUTERS: &str = "BALLOT_LEDGER_VOTING_COMPUTERS";
const VOTER_COMPUTERS: &str = "BALLOT_LEDGER_VOTER_COMPUTERS";
const KEY_BITS: &str = "BALLOT_LEDGER_KEY_BITS";
const KEY_DIR: &str = "BALLOT_LEDGER_KEY_DIR";
const CHAIN_DIR: &str = "BALLOT_LEDGER_CHAIN_DIR";
const SEED: &str = "BALLOT_LEDGER_SEED";

const MIN_KEY_BITS: u32 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has invalid value `{value}`")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: String,
    pub election_path: PathBuf,
    pub voting_computers: usize,
    pub voter_computers: usize,
    pub key_bits: u32,
    /// Directory holding the ballot generator key; a fresh key per run when unset.
    pub key_dir: Option<PathBuf>,
    /// Directory the chains are written to after each round.
    pub chain_dir: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "127.0.0.1:10040".to_string(),
            election_path: PathBuf::from("election.json"),
            voting_computers: 5,
            voter_computers: 5,
            key_bits: DEFAULT_KEY_BITS,
            key_dir: None,
            chain_dir: None,
            seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let config = Config {
            bind_addr: lookup(BIND).unwrap_or(defaults.bind_addr),
            election_path: lookup(ELECTION).map(PathBuf::from).unwrap_or(defaults.election_path),
            voting_computers: parse(&lookup, VOTING_COMPUTERS)?
                .unwrap_or(defaults.voting_computers),
            voter_computers: parse(&lookup, VOTER_COMPUTERS)?.unwrap_or(defaults.voter_computers),
            key_bits: parse(&lookup, KEY_BITS)?.unwrap_or(defaults.key_bits),
            key_dir: lookup(KEY_DIR).map(PathBuf::from),
            chain_dir: lookup(CHAIN_DIR).map(PathBuf::from),
            seed: parse(&lookup, SEED)?,
        };

        if config.voting_computers == 0 {
            return Err(invalid(VOTING_COMPUTERS, config.voting_computers));
        }
        if config.voter_computers == 0 {
            return Err(invalid(VOTER_COMPUTERS, config.voter_computers));
        }
        if config.key_bits < MIN_KEY_BITS {
            return Err(invalid(KEY_BITS, config.key_bits));
        }
        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::Invalid { key, value }),
        },
    }
}

fn invalid(key: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}
