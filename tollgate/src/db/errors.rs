use thiserror::Error;

/// Unified error type for storage operations that application code can handle
#[derive(Error, Debug)]
pub enum DbError {
    /// Entity not found by the given identifier
    #[error("Entity not found")]
    NotFound,

    /// Unique constraint violation
    #[error("Unique constraint violation")]
    UniqueViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
        /// The conflicting value that caused the violation (if extractable)
        conflicting_value: Option<String>,
    },

    /// Foreign key constraint violation
    #[error("Foreign key constraint violation")]
    ForeignKeyViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// Check constraint violation
    #[error("Check constraint violation")]
    CheckViolation {
        constraint: Option<String>,
        table: Option<String>,
        message: String,
    },

    /// The storage backend could not be reached (connection loss, pool
    /// exhaustion, timeout). Callers decide fail-open/fail-closed; the spend
    /// writer retries.
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    /// Table reported with a constraint violation, when the backend named one.
    pub fn table(&self) -> Option<&str> {
        match self {
            DbError::UniqueViolation { table, .. }
            | DbError::ForeignKeyViolation { table, .. }
            | DbError::CheckViolation { table, .. } => table.as_deref(),
            _ => None,
        }
    }

    /// Constraint name reported with a violation, when the backend named one.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            DbError::UniqueViolation { constraint, .. }
            | DbError::ForeignKeyViolation { constraint, .. }
            | DbError::CheckViolation { constraint, .. } => constraint.as_deref(),
            _ => None,
        }
    }
}

/// Convert from sqlx::Error using proper sqlx error categorization
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    let constraint = db_err.constraint().map(|s| s.to_string());

                    // Postgres unique violation details look like
                    // "Key (key_hash)=(abc123) already exists."
                    let conflicting_value = db_err
                        .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                        .and_then(|pg| pg.detail())
                        .and_then(extract_conflicting_value);

                    DbError::UniqueViolation {
                        constraint,
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                        conflicting_value,
                    }
                } else if db_err.is_foreign_key_violation() {
                    DbError::ForeignKeyViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else if db_err.is_check_violation() {
                    DbError::CheckViolation {
                        constraint: db_err.constraint().map(|s| s.to_string()),
                        table: db_err.table().map(|s| s.to_string()),
                        message: db_err.message().to_string(),
                    }
                } else {
                    DbError::Other(anyhow::Error::from(err))
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => DbError::Unavailable {
                message: err.to_string(),
            },
            _ => DbError::Other(anyhow::Error::from(err)),
        }
    }
}

/// Extract the conflicting value from a Postgres unique-violation detail
/// message of the form "Key (col)=(value) already exists."
fn extract_conflicting_value(detail: &str) -> Option<String> {
    let start = detail.find("=(")?;
    let end = detail[start + 2..].find(')')?;
    Some(detail[start + 2..start + 2 + end].to_string())
}

/// Type alias for storage operation results
pub type Result<T> = std::result::Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_accessors_expose_table_and_constraint() {
        let err = DbError::UniqueViolation {
            constraint: Some("daily_key_spend_pkey".to_string()),
            table: Some("daily_key_spend".to_string()),
            message: "duplicate key".to_string(),
            conflicting_value: None,
        };
        assert_eq!(err.table(), Some("daily_key_spend"));
        assert_eq!(err.constraint(), Some("daily_key_spend_pkey"));

        assert!(DbError::NotFound.table().is_none());
        let outage = DbError::Unavailable {
            message: "pool timed out".to_string(),
        };
        assert!(outage.constraint().is_none());
    }

    #[test]
    fn test_extract_conflicting_value() {
        assert_eq!(
            extract_conflicting_value("Key (key_hash)=(9f86d081) already exists."),
            Some("9f86d081".to_string())
        );
        assert_eq!(extract_conflicting_value("no key detail here"), None);
    }
}
