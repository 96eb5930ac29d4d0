//! Conflict retry for read-modify-write sequences.

use tracing::debug;

use crate::error::StateResult;

/// Attempts used by the store's own `modify_*` helpers.
pub const DEFAULT_CONFLICT_ATTEMPTS: usize = 5;

/// Run `f` until it succeeds, fails with a non-conflict error, or
/// `attempts` conflicts have been seen. `f` must re-read whatever it writes.
pub fn retry_on_conflict<T, F>(attempts: usize, mut f: F) -> StateResult<T>
where
    F: FnMut() -> StateResult<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match f() {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %e, "write conflict, retrying");
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;

    fn conflict() -> StateError {
        StateError::Conflict {
            kind: "apptargets",
            key: "web-prod".to_string(),
            observed: 1,
            stored: 2,
        }
    }

    #[test]
    fn retries_conflicts_until_success() {
        let mut calls = 0;
        let result = retry_on_conflict(3, || {
            calls += 1;
            if calls < 3 { Err(conflict()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_attempts() {
        let mut calls = 0;
        let result: StateResult<()> = retry_on_conflict(2, || {
            calls += 1;
            Err(conflict())
        });
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, 2);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut calls = 0;
        let result: StateResult<()> = retry_on_conflict(5, || {
            calls += 1;
            Err(StateError::NotFound("x".to_string()))
        });
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls, 1);
    }
}
