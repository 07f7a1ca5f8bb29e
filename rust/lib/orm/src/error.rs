use openerp_sql::SQLError;
use thiserror::Error;

// ── Error codes ─────────────────────────────────────────────────────
//
// Stable, machine-readable identifiers. Callers match on these,
// never on the human-readable message string.

/// Stable error code constants.
pub mod error_code {
    pub const ENTITY_NOT_FOUND: &str = "ENTITY_NOT_FOUND";
    pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
    pub const SEQUENCE_NOT_FOUND: &str = "SEQUENCE_NOT_FOUND";
    pub const CIRCULAR_DEPENDENCY: &str = "CIRCULAR_DEPENDENCY";
    pub const MISSING_DEPENDENCY: &str = "MISSING_DEPENDENCY";
    pub const TRANSACTION_FAILED: &str = "TRANSACTION_FAILED";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const NO_PARENT: &str = "NO_PARENT";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── OrmError ────────────────────────────────────────────────────────

/// Unified error type of the model engine.
///
/// Each variant maps to a stable error code (see [`error_code`]) and the
/// HTTP-equivalent status the REST layer reports for it.
#[derive(Error, Debug)]
pub enum OrmError {
    /// Unknown entity name at compile or access time. 404.
    #[error("entity '{0}' is not registered")]
    EntityNotFound(String),

    /// Invalid or missing field values. 400.
    #[error("{0}")]
    Validation(String),

    /// Unknown or inactive sequence code on `next`. 404.
    #[error("no active sequence with code '{0}'")]
    SequenceNotFound(String),

    /// Module dependency graph contains a cycle through `module`.
    #[error("circular dependency on module '{module}': {}", .cycle.join(" -> "))]
    CircularDependency { module: String, cycle: Vec<String> },

    /// Module depends on modules that are neither installed nor available.
    #[error("module '{module}' has missing dependencies: {}", .missing.join(", "))]
    MissingDependency { module: String, missing: Vec<String> },

    /// The transaction callback failed; the transaction was rolled back.
    #[error("transaction rolled back: {0}")]
    TransactionFailure(#[source] Box<OrmError>),

    /// No action with this name exists on the compiled entity. 404.
    #[error("entity '{entity}' has no action '{action}'")]
    UnknownAction { entity: String, action: String },

    /// A method called its parent but is the first implementation in the chain.
    #[error("method '{method}' on '{entity}' has no parent implementation")]
    NoParent { entity: String, method: String },

    /// A base definition was registered twice where uniqueness is required. 409.
    #[error("entity '{0}' is already defined")]
    DuplicateDefinition(String),

    /// Data-access failure.
    #[error("storage: {0}")]
    Storage(#[from] SQLError),

    /// Configuration could not be loaded or is invalid.
    #[error("config: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("{0}")]
    Internal(String),
}

impl OrmError {
    /// Shorthand for a validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        OrmError::Validation(msg.into())
    }

    /// Stable, machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            OrmError::EntityNotFound(_) => error_code::ENTITY_NOT_FOUND,
            OrmError::Validation(_) => error_code::VALIDATION_FAILED,
            OrmError::SequenceNotFound(_) => error_code::SEQUENCE_NOT_FOUND,
            OrmError::CircularDependency { .. } => error_code::CIRCULAR_DEPENDENCY,
            OrmError::MissingDependency { .. } => error_code::MISSING_DEPENDENCY,
            OrmError::TransactionFailure(_) => error_code::TRANSACTION_FAILED,
            OrmError::UnknownAction { .. } => error_code::UNKNOWN_ACTION,
            OrmError::NoParent { .. } => error_code::NO_PARENT,
            OrmError::DuplicateDefinition(_) => error_code::ALREADY_EXISTS,
            OrmError::Storage(_) => error_code::STORAGE_ERROR,
            OrmError::Config(_) => error_code::CONFIG_ERROR,
            OrmError::Internal(_) => error_code::INTERNAL,
        }
    }

    /// HTTP-equivalent status code for this error.
    ///
    /// A failed transaction reports the status of the error that caused it.
    pub fn status_code(&self) -> u16 {
        match self {
            OrmError::EntityNotFound(_)
            | OrmError::SequenceNotFound(_)
            | OrmError::UnknownAction { .. } => 404,
            OrmError::Validation(_) => 400,
            OrmError::DuplicateDefinition(_) => 409,
            OrmError::Storage(e) if e.is_constraint() => 409,
            OrmError::TransactionFailure(inner) => inner.status_code(),
            _ => 500,
        }
    }

    /// Whether this error means "the thing asked for does not exist".
    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(OrmError::EntityNotFound("x".into()).status_code(), 404);
        assert_eq!(OrmError::SequenceNotFound("x".into()).status_code(), 404);
        assert_eq!(OrmError::validation("x").status_code(), 400);
        assert_eq!(OrmError::DuplicateDefinition("x".into()).status_code(), 409);
        assert_eq!(OrmError::Internal("x".into()).status_code(), 500);
        assert_eq!(
            OrmError::Storage(SQLError::Query("x".into())).status_code(),
            500
        );
        assert_eq!(
            OrmError::Storage(SQLError::Constraint("x".into())).status_code(),
            409
        );
        assert_eq!(
            OrmError::TransactionFailure(Box::new(OrmError::validation("x"))).status_code(),
            400
        );
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(OrmError::EntityNotFound("x".into()).error_code(), "ENTITY_NOT_FOUND");
        assert_eq!(OrmError::validation("x").error_code(), "VALIDATION_FAILED");
        assert_eq!(OrmError::SequenceNotFound("x".into()).error_code(), "SEQUENCE_NOT_FOUND");
        assert_eq!(
            OrmError::CircularDependency {
                module: "a".into(),
                cycle: vec![]
            }
            .error_code(),
            "CIRCULAR_DEPENDENCY"
        );
        assert_eq!(
            OrmError::UnknownAction {
                entity: "sale.order".into(),
                action: "x".into()
            }
            .error_code(),
            "UNKNOWN_ACTION"
        );
    }

    #[test]
    fn messages() {
        let err = OrmError::CircularDependency {
            module: "a".into(),
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency on module 'a': a -> b -> a");

        let err = OrmError::MissingDependency {
            module: "sale".into(),
            missing: vec!["account".into(), "stock".into()],
        };
        assert_eq!(
            err.to_string(),
            "module 'sale' has missing dependencies: account, stock"
        );

        assert_eq!(
            OrmError::validation("field 'name' is required").to_string(),
            "field 'name' is required"
        );
    }
}
