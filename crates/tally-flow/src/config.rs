//! Runtime configuration for the consolidator.
//!
//! Every value can be overridden from the environment with strict validation;
//! malformed values are configuration errors, never silently defaulted.

use std::collections::BTreeSet;
use std::time::Duration;

use tally_core::TenantId;

use crate::error::{Error, Result};

const ENV_MAX_TRIES: &str = "TALLY_MAX_TRIES";
const ENV_MAX_TRANSACTION_ATTEMPTS: &str = "TALLY_MAX_TRANSACTION_ATTEMPTS";
const ENV_JOIN_STAGGER_SECS: &str = "TALLY_JOIN_STAGGER_SECS";
const ENV_SHARD_TABLE_PREFIX: &str = "TALLY_SHARD_TABLE_PREFIX";
const ENV_FINAL_TABLE: &str = "TALLY_FINAL_TABLE";
const ENV_AGGREGATED_TABLE: &str = "TALLY_AGGREGATED_TABLE";
const ENV_TASK_PATH_PREFIX: &str = "TALLY_TASK_PATH_PREFIX";
const ENV_EXCLUDED_TENANTS: &str = "TALLY_EXCLUDED_TENANTS";

const DEFAULT_MAX_TRIES: u32 = 3;
const DEFAULT_MAX_TRANSACTION_ATTEMPTS: u32 = 20;
const DEFAULT_JOIN_STAGGER_SECS: u64 = 8 * 60;
const DEFAULT_SHARD_TABLE_PREFIX: &str = "tmp_csp_billing";
const DEFAULT_FINAL_TABLE: &str = "csp_billing_full";
const DEFAULT_AGGREGATED_TABLE: &str = "csp_billing";
const DEFAULT_TASK_PATH_PREFIX: &str = "/tasks/consolidate";

/// Retry policy for state store transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateStoreConfig {
    /// Attempts before a write conflict becomes fatal.
    pub max_attempts: u32,
    /// First backoff delay.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
            backoff_base: Duration::from_millis(20),
            backoff_max: Duration::from_secs(1),
        }
    }
}

/// Consolidator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatorConfig {
    /// Failures a tenant may accumulate before it is force-marked processed.
    pub max_tries: u32,
    /// State store retry policy.
    pub state_store: StateStoreConfig,
    /// Delay increment between consecutive join tasks.
    pub join_stagger: Duration,
    /// Prefix of shard table names.
    pub shard_table_prefix: String,
    /// Table every shard is merged into.
    pub final_table: String,
    /// Output table of the aggregation step.
    pub aggregated_table: String,
    /// Path prefix of the task delivery endpoints.
    pub task_path_prefix: String,
    /// Tenants never enumerated for a reseller-wide run.
    pub excluded_tenants: BTreeSet<TenantId>,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            state_store: StateStoreConfig::default(),
            join_stagger: Duration::from_secs(DEFAULT_JOIN_STAGGER_SECS),
            shard_table_prefix: DEFAULT_SHARD_TABLE_PREFIX.to_string(),
            final_table: DEFAULT_FINAL_TABLE.to_string(),
            aggregated_table: DEFAULT_AGGREGATED_TABLE.to_string(),
            task_path_prefix: DEFAULT_TASK_PATH_PREFIX.to_string(),
            excluded_tenants: BTreeSet::new(),
        }
    }
}

impl ConsolidatorConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is present but invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is present but invalid.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_tries = parse_positive_u32_env(&get_env, ENV_MAX_TRIES, DEFAULT_MAX_TRIES)?;
        let max_attempts = parse_positive_u32_env(
            &get_env,
            ENV_MAX_TRANSACTION_ATTEMPTS,
            DEFAULT_MAX_TRANSACTION_ATTEMPTS,
        )?;
        let stagger_secs =
            parse_positive_u64_env(&get_env, ENV_JOIN_STAGGER_SECS, DEFAULT_JOIN_STAGGER_SECS)?;

        let excluded_tenants = match get_env(ENV_EXCLUDED_TENANTS) {
            None => BTreeSet::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    TenantId::new(s).map_err(|e| {
                        Error::configuration(format!("{ENV_EXCLUDED_TENANTS}: {e}"))
                    })
                })
                .collect::<Result<_>>()?,
        };

        let task_path_prefix =
            parse_string_env(&get_env, ENV_TASK_PATH_PREFIX, &defaults.task_path_prefix)?;
        if !task_path_prefix.starts_with('/') || task_path_prefix.ends_with('/') {
            return Err(Error::configuration(format!(
                "{ENV_TASK_PATH_PREFIX} must start with '/' and not end with '/', got '{task_path_prefix}'"
            )));
        }

        Ok(Self {
            max_tries,
            state_store: StateStoreConfig {
                max_attempts,
                ..defaults.state_store
            },
            join_stagger: Duration::from_secs(stagger_secs),
            shard_table_prefix: parse_string_env(
                &get_env,
                ENV_SHARD_TABLE_PREFIX,
                &defaults.shard_table_prefix,
            )?,
            final_table: parse_string_env(&get_env, ENV_FINAL_TABLE, &defaults.final_table)?,
            aggregated_table: parse_string_env(
                &get_env,
                ENV_AGGREGATED_TABLE,
                &defaults.aggregated_table,
            )?,
            task_path_prefix,
            excluded_tenants,
        })
    }

    /// Sets the per-tenant failure ceiling.
    #[must_use]
    pub const fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Sets the join stagger.
    #[must_use]
    pub const fn with_join_stagger(mut self, stagger: Duration) -> Self {
        self.join_stagger = stagger;
        self
    }

    /// Sets the state store retry policy.
    #[must_use]
    pub const fn with_state_store(mut self, state_store: StateStoreConfig) -> Self {
        self.state_store = state_store;
        self
    }

    /// Adds a tenant to the exclusion list.
    #[must_use]
    pub fn excluding(mut self, tenant: TenantId) -> Self {
        self.excluded_tenants.insert(tenant);
        self
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_positive_u32_env<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_positive_u64_env(get_env, key, u64::from(default))?;
    u32::try_from(parsed)
        .map_err(|_| Error::configuration(format!("{key} value {parsed} exceeds supported range")))
}

fn parse_string_env<F>(get_env: &F, key: &str, default: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match get_env(key) {
        None => Ok(default.to_string()),
        Some(raw) if raw.trim().is_empty() => {
            Err(Error::configuration(format!("{key} cannot be empty")))
        }
        Some(raw) => Ok(raw.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ConsolidatorConfig::from_env_with(|_| None).unwrap();
        assert_eq!(config, ConsolidatorConfig::default());
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.state_store.max_attempts, 20);
        assert_eq!(config.join_stagger, Duration::from_secs(480));
    }

    #[test]
    fn overrides_are_applied() {
        let config = ConsolidatorConfig::from_env_with(env(&[
            (ENV_MAX_TRIES, "5"),
            (ENV_MAX_TRANSACTION_ATTEMPTS, "7"),
            (ENV_JOIN_STAGGER_SECS, "60"),
            (ENV_FINAL_TABLE, "full"),
            (ENV_EXCLUDED_TENANTS, "e2e-test, other"),
        ]))
        .unwrap();
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.state_store.max_attempts, 7);
        assert_eq!(config.join_stagger, Duration::from_secs(60));
        assert_eq!(config.final_table, "full");
        assert_eq!(config.excluded_tenants.len(), 2);
        assert!(
            config
                .excluded_tenants
                .contains(&TenantId::new("e2e-test").unwrap())
        );
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        assert!(ConsolidatorConfig::from_env_with(env(&[(ENV_MAX_TRIES, "0")])).is_err());
        assert!(ConsolidatorConfig::from_env_with(env(&[(ENV_MAX_TRIES, "three")])).is_err());
        assert!(
            ConsolidatorConfig::from_env_with(env(&[(ENV_MAX_TRIES, "99999999999")])).is_err()
        );
        assert!(ConsolidatorConfig::from_env_with(env(&[(ENV_FINAL_TABLE, " ")])).is_err());
        assert!(
            ConsolidatorConfig::from_env_with(env(&[(ENV_EXCLUDED_TENANTS, "bad tenant")]))
                .is_err()
        );
    }

    #[test]
    fn task_path_prefix_is_validated() {
        assert!(
            ConsolidatorConfig::from_env_with(env(&[(ENV_TASK_PATH_PREFIX, "tasks")])).is_err()
        );
        assert!(
            ConsolidatorConfig::from_env_with(env(&[(ENV_TASK_PATH_PREFIX, "/tasks/")])).is_err()
        );
        let config =
            ConsolidatorConfig::from_env_with(env(&[(ENV_TASK_PATH_PREFIX, "/t/csp")])).unwrap();
        assert_eq!(config.task_path_prefix, "/t/csp");
    }
}
