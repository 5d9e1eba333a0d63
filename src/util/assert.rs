/// Panic with an engine-internal assertion message when the condition is
/// false. Hard asserts indicate a broken invariant inside the engine; they
/// are never caught or retried.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", assertion_error(message));
    }
}

/// Signal an impossible state. Used where control flow should be
/// unreachable (e.g. exhaustive matches on validated data).
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

/// Build the string used when raising assertion errors.
pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!("INTERNAL ASSERT FAILED: {}", message.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn hard_assert_panics_on_false() {
        hard_assert(false, "should panic");
    }

    #[test]
    fn assertion_error_formats_message() {
        let err = assertion_error("boom");
        assert!(err.contains("boom"));
    }
}
