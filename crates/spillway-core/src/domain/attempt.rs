//! Per-attempt outcome consumed by the retry loop.

use std::time::Duration;

use super::errors::ErrorClass;

/// Result of a single attempt at an external call.
///
/// - `Success`: the call produced a value.
/// - `Retryable`: the call failed in a way a later attempt may fix.
/// - `Fatal`: retrying is pointless; surface the error.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Retryable {
        error: E,
        class: ErrorClass,
        /// Minimum wait suggested by the failing side (e.g. `Retry-After`).
        retry_after: Option<Duration>,
    },
    Fatal(E),
}
