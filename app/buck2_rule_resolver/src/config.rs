/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */


use std::env;
use std::env::VarError;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::OnceCell;

static RULE_INDEX_CAPACITY: EnvOverride<usize> = EnvOverride::new("BUCK2_RULE_INDEX_CAPACITY");
static RULE_INDEX_SHARDS: EnvOverride<usize> = EnvOverride::new("BUCK2_RULE_INDEX_SHARDS");
static SLOW_RULE_CONSTRUCTION_MS: EnvOverride<u64> =
    EnvOverride::new("BUCK2_SLOW_RULE_CONSTRUCTION_MS");

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolverConfigError {
    #[error("Rule index shard amount must be a power of two greater than one, got {0}")]
    InvalidShardAmount(usize),
    #[error("Invalid value for ${var}: `{value}`: {reason}")]
    InvalidEnvValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("Value of ${0} is not unicode")]
    NonUnicodeEnvValue(&'static str),
}

/// A resolver setting overridable from the environment. The variable is read and parsed once
/// per process; later changes to it are not observed.
struct EnvOverride<T> {
    var: &'static str,
    cell: OnceCell<Option<T>>,
}

impl<T> EnvOverride<T> {
    const fn new(var: &'static str) -> Self {
        Self {
            var,
            cell: OnceCell::new(),
        }
    }
}

impl<T> EnvOverride<T>
where
    T: FromStr + Copy,
    T::Err: Display,
{
    fn get(&'static self) -> Result<Option<T>, ResolverConfigError> {
        let var = self.var;
        let value = self.cell.get_or_try_init(|| match env::var(var) {
            Ok(value) => {
                tracing::info!("Env override found: ${} = {}", var, value);
                match value.trim().parse() {
                    Ok(parsed) => Ok(Some(parsed)),
                    Err(e) => Err(ResolverConfigError::InvalidEnvValue {
                        var,
                        reason: e.to_string(),
                        value,
                    }),
                }
            }
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(..)) => Err(ResolverConfigError::NonUnicodeEnvValue(var)),
        })?;
        Ok(*value)
    }
}

/// Tuning knobs for a [`crate::resolver::BuildRuleResolver`]. None of them affect which rules
/// get built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRuleResolverConfig {
    /// Expected number of rules, to presize the index.
    pub index_capacity: usize,
    /// Number of shards of the rule index. `None` lets dashmap pick based on the CPU count.
    pub index_shard_amount: Option<usize>,
    /// Constructions taking longer than this are logged as warnings.
    pub slow_construction_threshold: Option<Duration>,
}

impl BuildRuleResolverConfig {
    /// Defaults, overridden by `$BUCK2_RULE_INDEX_CAPACITY`, `$BUCK2_RULE_INDEX_SHARDS` and
    /// `$BUCK2_SLOW_RULE_CONSTRUCTION_MS`.
    pub fn from_env() -> Result<BuildRuleResolverConfig, ResolverConfigError> {
        let config = BuildRuleResolverConfig {
            index_capacity: RULE_INDEX_CAPACITY.get()?.unwrap_or_default(),
            index_shard_amount: RULE_INDEX_SHARDS.get()?,
            slow_construction_threshold: SLOW_RULE_CONSTRUCTION_MS
                .get()?
                .map(Duration::from_millis),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ResolverConfigError> {
        match self.index_shard_amount {
            Some(shards) if shards < 2 || !shards.is_power_of_two() => {
                Err(ResolverConfigError::InvalidShardAmount(shards))
            }
            _ => Ok(()),
        }
    }
}
