/// Stable status codes returned across every fallible operation in the core.
///
/// Category 1 (contract violation), category 2 (resource exhaustion), and
/// category 3 (fatal, not representable here — those are `panic!`s from
/// `validate()`) map onto this one enum so callers have a single stable
/// vocabulary at the syscall boundary, per the external-interfaces contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Status {
    /// Misaligned, empty, non-canonical, or otherwise malformed input.
    #[error("invalid input")]
    InvalidInput,
    /// Range empty, reversed, or exceeds configured limits.
    #[error("invalid span")]
    InvalidSpan,
    /// Non-canonical, higher-half when user expected, or out of range.
    #[error("invalid address")]
    InvalidAddress,
    /// Command-list validation failed (overlapping operations).
    #[error("invalid data")]
    InvalidData,
    /// PFH, PTA, or control-block pool exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// Range overlaps an existing allocation.
    #[error("not available")]
    NotAvailable,
    /// Range not managed by this heap.
    #[error("not found")]
    NotFound,
    /// Operation not implemented for this entity kind.
    #[error("not supported")]
    NotSupported,
    /// Non-blocking lock acquisition failed (logger-only; the core never
    /// blocks, so this is reserved for future non-blocking entry points).
    #[error("device busy")]
    DeviceBusy,
}

/// `Status::Success` has no payload in this enum; fallible operations return
/// `Result<T, Status>` instead of a bare status plus out-params, which is the
/// idiomatic Rust rendering of "status code plus out-parameters" from the
/// core's error-handling design.
pub type VmResult<T> = Result<T, Status>;
