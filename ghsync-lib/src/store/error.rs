use core::fmt::{Display, Formatter};
use rusqlite::ErrorCode;

/// Errors surfaced by storage writes.
#[derive(Debug)]
pub enum StoreError {
    /// The write collided with a unique index.
    ConstraintViolation { detail: String },

    /// Any other storage failure.
    Other(ohno::AppError),
}

impl StoreError {
    #[must_use]
    pub const fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ConstraintViolation { detail } => write!(f, "constraint violation: {detail}"),
            Self::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => Self::ConstraintViolation {
                detail: msg.unwrap_or_else(|| err.to_string()),
            },
            other => Self::Other(ohno::AppError::new(other)),
        }
    }
}

impl From<StoreError> for ohno::AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConstraintViolation { detail } => ohno::app_err!("constraint violation: {detail}"),
            StoreError::Other(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn unique_collision_maps_to_constraint_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY); INSERT INTO t VALUES ('a');")
            .unwrap();

        let err = conn.execute("INSERT INTO t VALUES ('a')", []).unwrap_err();
        let err = StoreError::from(err);
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn other_failures_are_not_constraint_violations() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn.execute("INSERT INTO missing VALUES (1)", []).unwrap_err();
        let err = StoreError::from(err);
        assert!(!err.is_constraint_violation());
        assert!(matches!(err, StoreError::Other(_)));
    }
}
