//! Error types for Warden operations

use crate::EntityKind;
use thiserror::Error;

/// Persistence layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {kind:?} with id {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Cache and lookup-resolution errors.
///
/// Staleness is never an error here: stale writes are discarded silently and
/// exhausted lookups resolve to "not found".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Ambiguous {category} lookup for {criteria}: {matches} live candidates match")]
    AmbiguousResolution {
        category: String,
        criteria: String,
        matches: usize,
    },

    #[error("Cache backend failure: {reason}")]
    Backend { reason: String },
}

/// Workflow engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Invalid restart position {position}: workflow has {step_count} steps")]
    InvalidRestartPosition { position: i64, step_count: usize },

    #[error("Step {step_id} ({provider_id}) failed: {reason}")]
    StepExecutionFailed {
        step_id: String,
        provider_id: String,
        reason: String,
    },

    #[error("Step provider {provider_id} requires {expected}, got an unsupported execution context")]
    UnsupportedContextType {
        provider_id: String,
        expected: String,
    },

    #[error("No step provider registered for {provider_id}")]
    UnknownStepProvider { provider_id: String },

    #[error("Workflow not found: {workflow_id}")]
    UnknownWorkflow { workflow_id: String },

    #[error("Step {step_id} not found in workflow {workflow_id}")]
    StepNotFound { workflow_id: String, step_id: String },

    #[error("No resource type provider registered for {resource_type}")]
    UnknownResourceType { resource_type: String },

    #[error("Invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Execution {execution_id} exceeded {limit} inline steps without suspending")]
    InlineStepLimit { execution_id: String, limit: usize },

    #[error("Invalid workflow {workflow_id}: {reason}")]
    InvalidDefinition { workflow_id: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Warden errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WardenError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl WardenError {
    /// Returns true for the ambiguous-lookup error surfaced by lookup resolution.
    pub fn is_ambiguous_resolution(&self) -> bool {
        matches!(self, WardenError::Cache(CacheError::AmbiguousResolution { .. }))
    }
}

/// Result type alias for Warden operations.
pub type WardenResult<T> = Result<T, WardenError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            kind: EntityKind::Role,
            id: "role-1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("Role"));
        assert!(msg.contains("role-1"));
    }

    #[test]
    fn test_cache_error_display_ambiguous() {
        let err = CacheError::AmbiguousResolution {
            category: "identity-provider".to_string(),
            criteria: "issuer=https://idp.example".to_string(),
            matches: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Ambiguous identity-provider lookup"));
        assert!(msg.contains("https://idp.example"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_workflow_error_display_restart_position() {
        let err = WorkflowError::InvalidRestartPosition {
            position: 99,
            step_count: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("99"));
        assert!(msg.contains("4 steps"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "WARDEN_CACHE_MAX_ENTRIES".to_string(),
            value: "lots".to_string(),
            reason: "must be an integer".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("WARDEN_CACHE_MAX_ENTRIES"));
        assert!(msg.contains("lots"));
        assert!(msg.contains("must be an integer"));
    }

    #[test]
    fn test_warden_error_from_variants() {
        let storage = WardenError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, WardenError::Storage(_)));

        let cache = WardenError::from(CacheError::Backend {
            reason: "down".to_string(),
        });
        assert!(matches!(cache, WardenError::Cache(_)));

        let workflow = WardenError::from(WorkflowError::UnknownWorkflow {
            workflow_id: "wf".to_string(),
        });
        assert!(matches!(workflow, WardenError::Workflow(_)));

        let config = WardenError::from(ConfigError::MissingRequired {
            field: "node_id".to_string(),
        });
        assert!(matches!(config, WardenError::Config(_)));
    }

    #[test]
    fn test_is_ambiguous_resolution() {
        let err = WardenError::from(CacheError::AmbiguousResolution {
            category: "client".to_string(),
            criteria: "a=b".to_string(),
            matches: 3,
        });
        assert!(err.is_ambiguous_resolution());
        assert!(!WardenError::from(StorageError::LockPoisoned).is_ambiguous_resolution());
    }
}
