use crate::error::FirestoreErrorCode;

/// Whether an RPC status can never be fixed by retrying with the same
/// arguments.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Permanence for write-stream errors. `Aborted` means the commit raced
/// and the write can be retried, unlike on other RPCs.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    if code == FirestoreErrorCode::Aborted {
        return false;
    }
    is_permanent_error(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_not_permanent() {
        for code in [
            FirestoreErrorCode::Cancelled,
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::Unauthenticated,
            FirestoreErrorCode::ResourceExhausted,
        ] {
            assert!(!is_permanent_error(code));
        }
    }

    #[test]
    fn aborted_is_permanent_except_for_writes() {
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::FailedPrecondition));
    }
}
