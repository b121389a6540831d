//! Tree configuration.
//!
//! Configuration is loaded from environment variables, with defaults for
//! anything unset.
//!
//! # Environment Variables
//!
//! - `TDB_HALF_DEGREE`: half-degree `t` for newly created nodes (default: `4`)
//! - `TDB_DELETE_STRATEGY`: `tombstone` or `structural` (default: `tombstone`)
//! - `TDB_MAX_CAS_RETRIES`: root swap attempts per write before giving up
//!   (default: `4096`)
//!
//! # Invariants
//!
//! - `half_degree` is within `MIN_HALF_DEGREE..=MAX_HALF_DEGREE`, so a node
//!   of that degree fits in one page
//! - `max_cas_retries` is at least 1

use std::str::FromStr;

use crate::storage::btree::{MAX_HALF_DEGREE, MIN_HALF_DEGREE};

/// How `remove` takes a key out of the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteStrategy {
    /// Copy the path and clear the key's validity flag.
    #[default]
    Tombstone,
    /// Copy the path and drop the key, pulling up its in-order predecessor
    /// when it sits in an internal node.
    StructuralCopy,
}

impl FromStr for DeleteStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tombstone" => Ok(Self::Tombstone),
            "structural" | "structural-copy" => Ok(Self::StructuralCopy),
            other => Err(format!(
                "'{other}' is not a delete strategy (expected 'tombstone' or 'structural')"
            )),
        }
    }
}

/// Parameters for a [`BTree`](crate::storage::btree::BTree) handle.
///
/// # Post-conditions
///
/// A config returned by `from_env()` or `from_lookup()` has passed
/// `validate()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    /// Half-degree for new nodes. Nodes hold at most `2t - 1` keys.
    pub half_degree: u16,
    /// Removal strategy.
    pub delete_strategy: DeleteStrategy,
    /// Lost root swaps tolerated per write.
    pub max_cas_retries: u32,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            half_degree: Self::DEFAULT_HALF_DEGREE,
            delete_strategy: DeleteStrategy::default(),
            max_cas_retries: Self::DEFAULT_MAX_CAS_RETRIES,
        }
    }
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl TreeConfig {
    /// Default half-degree.
    pub const DEFAULT_HALF_DEGREE: u16 = 4;
    /// Default retry bound.
    pub const DEFAULT_MAX_CAS_RETRIES: u32 = 4096;

    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but unparsable or out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("TDB_HALF_DEGREE") {
            config.half_degree = parse("TDB_HALF_DEGREE", &value)?;
        }
        if let Some(value) = lookup("TDB_DELETE_STRATEGY") {
            config.delete_strategy = value.parse().map_err(|message| ConfigError::InvalidValue {
                name: "TDB_DELETE_STRATEGY".to_string(),
                message,
            })?;
        }
        if let Some(value) = lookup("TDB_MAX_CAS_RETRIES") {
            config.max_cas_retries = parse("TDB_MAX_CAS_RETRIES", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants listed in the module docs.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first field out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_HALF_DEGREE..=MAX_HALF_DEGREE).contains(&self.half_degree) {
            return Err(ConfigError::InvalidValue {
                name: "half_degree".to_string(),
                message: format!(
                    "{} is outside {MIN_HALF_DEGREE}..={MAX_HALF_DEGREE}",
                    self.half_degree
                ),
            });
        }
        if self.max_cas_retries == 0 {
            return Err(ConfigError::InvalidValue {
                name: "max_cas_retries".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = TreeConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config, TreeConfig::default());
        assert_eq!(config.half_degree, 4);
        assert_eq!(config.delete_strategy, DeleteStrategy::Tombstone);
        assert_eq!(config.max_cas_retries, 4096);
    }

    #[test]
    fn test_all_variables_set() {
        let config = TreeConfig::from_lookup(lookup_from(&[
            ("TDB_HALF_DEGREE", "16"),
            ("TDB_DELETE_STRATEGY", "structural"),
            ("TDB_MAX_CAS_RETRIES", "10"),
        ]))
        .expect("valid config");

        assert_eq!(config.half_degree, 16);
        assert_eq!(config.delete_strategy, DeleteStrategy::StructuralCopy);
        assert_eq!(config.max_cas_retries, 10);
    }

    #[test]
    fn test_half_degree_out_of_range() {
        for value in ["1", "83", "0"] {
            let err = TreeConfig::from_lookup(lookup_from(&[("TDB_HALF_DEGREE", value)]))
                .expect_err("out of range");
            assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "half_degree"));
        }

        let config = TreeConfig::from_lookup(lookup_from(&[("TDB_HALF_DEGREE", "82")]))
            .expect("largest degree that fits a page");
        assert_eq!(config.half_degree, 82);
    }

    #[test]
    fn test_unparsable_values() {
        let err = TreeConfig::from_lookup(lookup_from(&[("TDB_HALF_DEGREE", "four")]))
            .expect_err("not a number");
        assert_eq!(
            err.to_string(),
            "invalid value for TDB_HALF_DEGREE: 'four' is not a valid number"
        );

        let err = TreeConfig::from_lookup(lookup_from(&[("TDB_DELETE_STRATEGY", "merge")]))
            .expect_err("unknown strategy");
        assert!(err.to_string().starts_with("invalid value for TDB_DELETE_STRATEGY"));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let err = TreeConfig::from_lookup(lookup_from(&[("TDB_MAX_CAS_RETRIES", "0")]))
            .expect_err("zero retries");
        assert_eq!(
            err.to_string(),
            "invalid value for max_cas_retries: must be at least 1"
        );
    }

    #[test]
    fn test_delete_strategy_parse() {
        assert_eq!("tombstone".parse(), Ok(DeleteStrategy::Tombstone));
        assert_eq!("structural-copy".parse(), Ok(DeleteStrategy::StructuralCopy));
        assert!("Tombstone".parse::<DeleteStrategy>().is_err());
    }
}
