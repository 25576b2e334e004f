use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const PROPERTY_MANAGE_RELATIONS: &str = "objstate.manageRelationships";
pub const PROPERTY_QUEUED_UPDATES: &str = "objstate.queuedUpdates";
pub const PROPERTY_REACHABILITY_AT_COMMIT: &str = "objstate.persistenceByReachabilityAtCommit";
pub const PROPERTY_RETAIN_VALUES: &str = "objstate.retainValues";
pub const PROPERTY_POOL_CAPACITY: &str = "objstate.stateManagerPoolCapacity";

/// Per-context behaviour switches. The runtime holds the defaults; each
/// context starts from a copy and may override it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub manage_relations: bool,
    /// Defer container changes to flush as individual operations.
    pub queued_updates: bool,
    pub reachability_at_commit: bool,
    /// Keep field values after commit instead of going hollow.
    pub retain_values: bool,
    pub pool_capacity: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            manage_relations: true,
            queued_updates: false,
            reachability_at_commit: true,
            retain_values: true,
            pool_capacity: 64,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, EngineError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(EngineError::InvalidProperty(format!(
            "{name} expects true or false, got {value:?}"
        ))),
    }
}

impl ContextConfig {
    /// Override one setting by its property name.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        match name {
            PROPERTY_MANAGE_RELATIONS => self.manage_relations = parse_bool(name, value)?,
            PROPERTY_QUEUED_UPDATES => self.queued_updates = parse_bool(name, value)?,
            PROPERTY_REACHABILITY_AT_COMMIT => {
                self.reachability_at_commit = parse_bool(name, value)?
            }
            PROPERTY_RETAIN_VALUES => self.retain_values = parse_bool(name, value)?,
            PROPERTY_POOL_CAPACITY => {
                self.pool_capacity = value.trim().parse().map_err(|_| {
                    EngineError::InvalidProperty(format!(
                        "{name} expects a non-negative integer, got {value:?}"
                    ))
                })?
            }
            _ => return Err(EngineError::InvalidProperty(format!("unknown property {name}"))),
        }
        Ok(())
    }

    pub fn property(&self, name: &str) -> Option<String> {
        let value = match name {
            PROPERTY_MANAGE_RELATIONS => self.manage_relations.to_string(),
            PROPERTY_QUEUED_UPDATES => self.queued_updates.to_string(),
            PROPERTY_REACHABILITY_AT_COMMIT => self.reachability_at_commit.to_string(),
            PROPERTY_RETAIN_VALUES => self.retain_values.to_string(),
            PROPERTY_POOL_CAPACITY => self.pool_capacity.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ContextConfig::default();
        assert!(config.manage_relations);
        assert!(!config.queued_updates);
        assert!(config.reachability_at_commit);
        assert!(config.retain_values);
        assert_eq!(config.pool_capacity, 64);
    }

    #[test]
    fn set_property_parses_values() {
        let mut config = ContextConfig::default();
        config.set_property(PROPERTY_QUEUED_UPDATES, "TRUE").unwrap();
        config.set_property(PROPERTY_POOL_CAPACITY, " 8 ").unwrap();
        assert!(config.queued_updates);
        assert_eq!(config.pool_capacity, 8);
        assert_eq!(config.property(PROPERTY_QUEUED_UPDATES).as_deref(), Some("true"));
    }

    #[test]
    fn set_property_rejects_bad_input() {
        let mut config = ContextConfig::default();
        assert!(matches!(
            config.set_property(PROPERTY_RETAIN_VALUES, "yes"),
            Err(EngineError::InvalidProperty(_))
        ));
        assert!(matches!(
            config.set_property("objstate.nope", "true"),
            Err(EngineError::InvalidProperty(_))
        ));
        assert_eq!(config, ContextConfig::default());
    }

    #[derive(Serialize)]
    struct QueuedOnly {
        queued_updates: bool,
    }

    #[test]
    fn missing_settings_fall_back_to_defaults() {
        let bytes = rmp_serde::to_vec_named(&QueuedOnly { queued_updates: true }).unwrap();
        let config: ContextConfig = rmp_serde::from_slice(&bytes).unwrap();
        assert!(config.queued_updates);
        assert!(config.manage_relations);
        assert_eq!(config.pool_capacity, 64);
    }
}
