//! Condition translation.
//!
//! Maps a backend-neutral [`WriteCondition`] onto the native precondition
//! each provider evaluates atomically, and maps native failure responses
//! back onto the neutral taxonomy.  Both directions are pure functions.
//!
//! | Condition            | S3                | Azure             | GCS                     |
//! |----------------------|-------------------|-------------------|-------------------------|
//! | `ByGeneration(0)`    | `If-None-Match: *`| `If-None-Match: *`| `ifGenerationMatch=0`   |
//! | `ByGeneration(n)`    | unsupported       | unsupported       | `ifGenerationMatch=n`   |
//! | `ByETag(e)`          | `If-Match: e`     | `If-Match: e`     | unsupported             |
//! | `ByLease(id)`        | unsupported       | `x-ms-lease-id`   | unsupported             |

use crate::config::BackendType;
use crate::errors::{Result, StoreError};

use super::backend::{quote_etag, WriteCondition};

/// A precondition in the vocabulary of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativePrecondition {
    /// `If-Match: <etag>`.
    IfMatch(String),
    /// `If-None-Match: *` -- create only.
    IfNoneMatchAny,
    /// `ifGenerationMatch=<n>`; `0` means the object must not exist.
    IfGenerationMatch(i64),
    /// `x-ms-lease-id: <id>`.
    LeaseId(String),
}

/// Translate `condition` for `backend`.
pub fn translate(condition: &WriteCondition, backend: BackendType) -> Result<NativePrecondition> {
    let unsupported = || StoreError::UnsupportedCondition {
        backend,
        condition: condition.to_string(),
    };

    match condition {
        WriteCondition::ByGeneration(generation) if *generation < 0 => Err(
            StoreError::InvalidCondition(format!("negative generation {generation}")),
        ),
        WriteCondition::ByETag(etag) if etag.trim().is_empty() => Err(
            StoreError::InvalidCondition("empty ETag in if-match condition".to_string()),
        ),
        WriteCondition::ByLease(id) if id.trim().is_empty() => Err(StoreError::InvalidCondition(
            "empty lease ID in lease condition".to_string(),
        )),

        WriteCondition::ByGeneration(0) => match backend {
            BackendType::S3 | BackendType::Azure => Ok(NativePrecondition::IfNoneMatchAny),
            BackendType::Gcs | BackendType::Memory => Ok(NativePrecondition::IfGenerationMatch(0)),
        },
        WriteCondition::ByGeneration(generation) => match backend {
            BackendType::Gcs | BackendType::Memory => {
                Ok(NativePrecondition::IfGenerationMatch(*generation))
            }
            BackendType::S3 | BackendType::Azure => Err(unsupported()),
        },
        WriteCondition::ByETag(etag) => match backend {
            BackendType::S3 | BackendType::Azure | BackendType::Memory => {
                Ok(NativePrecondition::IfMatch(quote_etag(etag)))
            }
            BackendType::Gcs => Err(unsupported()),
        },
        WriteCondition::ByLease(id) => match backend {
            BackendType::Azure | BackendType::Memory => Ok(NativePrecondition::LeaseId(id.clone())),
            BackendType::S3 | BackendType::Gcs => Err(unsupported()),
        },
    }
}

/// Neutral classification of a failed provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    NotFound,
    PreconditionFailed,
    LeaseConflict,
    Transient,
    /// Any other failure; passed through as a backend error.
    Fatal,
}

/// Classify a failed provider response from its HTTP status and the
/// provider's error code (`x-ms-error-code`, S3 error code, GCS reason).
pub fn classify_failure(
    backend: BackendType,
    status: Option<u16>,
    code: Option<&str>,
) -> FailureClass {
    let code = code.unwrap_or("");

    // Lease errors first: Azure reports them as 409 or 412 and they must not
    // be mistaken for version mismatches.
    if backend == BackendType::Azure && code.starts_with("Lease") {
        return FailureClass::LeaseConflict;
    }

    match (backend, code) {
        (BackendType::Azure, "BlobAlreadyExists") => return FailureClass::PreconditionFailed,
        (BackendType::Azure, "ConditionNotMet") => return FailureClass::PreconditionFailed,
        (BackendType::Azure, "ServerBusy" | "OperationTimedOut" | "InternalError") => {
            return FailureClass::Transient
        }
        (BackendType::S3, "PreconditionFailed") => return FailureClass::PreconditionFailed,
        (BackendType::S3, "NoSuchKey" | "NotFound") => return FailureClass::NotFound,
        // A concurrent conditional write to the same key was in flight; the
        // retried request re-evaluates the condition.
        (BackendType::S3, "ConditionalRequestConflict") => return FailureClass::Transient,
        (
            BackendType::S3,
            "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"
            | "RequestTimeTooSkewed",
        ) => return FailureClass::Transient,
        (BackendType::Gcs, "conditionNotMet") => return FailureClass::PreconditionFailed,
        (BackendType::Gcs, "rateLimitExceeded" | "userRateLimitExceeded" | "backendError") => {
            return FailureClass::Transient
        }
        _ => {}
    }

    match status {
        Some(404) => FailureClass::NotFound,
        Some(412) => FailureClass::PreconditionFailed,
        Some(408) | Some(429) => FailureClass::Transient,
        Some(s) if (500..600).contains(&s) => FailureClass::Transient,
        // No response at all: connection reset, DNS, timeout.
        None => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// Build the neutral error for a classified failure.
pub fn failure_to_error(
    class: FailureClass,
    target: &str,
    key: &str,
    operation: &'static str,
    status: Option<u16>,
    message: String,
) -> StoreError {
    match class {
        FailureClass::NotFound => StoreError::NotFound {
            target: target.to_string(),
            key: key.to_string(),
        },
        FailureClass::PreconditionFailed => StoreError::PreconditionFailed {
            target: target.to_string(),
            key: key.to_string(),
        },
        FailureClass::LeaseConflict => StoreError::LeaseConflict {
            target: target.to_string(),
            key: key.to_string(),
            message,
        },
        FailureClass::Transient => StoreError::Transient {
            target: target.to_string(),
            key: key.to_string(),
            operation,
            message,
        },
        FailureClass::Fatal => StoreError::Backend {
            target: target.to_string(),
            key: key.to_string(),
            operation,
            status,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_only_on_every_backend() {
        let cond = WriteCondition::must_not_exist();
        assert_eq!(
            translate(&cond, BackendType::S3).unwrap(),
            NativePrecondition::IfNoneMatchAny
        );
        assert_eq!(
            translate(&cond, BackendType::Azure).unwrap(),
            NativePrecondition::IfNoneMatchAny
        );
        assert_eq!(
            translate(&cond, BackendType::Gcs).unwrap(),
            NativePrecondition::IfGenerationMatch(0)
        );
        assert_eq!(
            translate(&cond, BackendType::Memory).unwrap(),
            NativePrecondition::IfGenerationMatch(0)
        );
    }

    #[test]
    fn test_etag_condition() {
        let cond = WriteCondition::ByETag("abc123".to_string());
        assert_eq!(
            translate(&cond, BackendType::S3).unwrap(),
            NativePrecondition::IfMatch("\"abc123\"".to_string())
        );
        assert_eq!(
            translate(&cond, BackendType::Azure).unwrap(),
            NativePrecondition::IfMatch("\"abc123\"".to_string())
        );
        assert!(matches!(
            translate(&cond, BackendType::Gcs),
            Err(StoreError::UnsupportedCondition {
                backend: BackendType::Gcs,
                ..
            })
        ));
    }

    #[test]
    fn test_generation_condition() {
        let cond = WriteCondition::ByGeneration(1_700_000_000_123_456);
        assert_eq!(
            translate(&cond, BackendType::Gcs).unwrap(),
            NativePrecondition::IfGenerationMatch(1_700_000_000_123_456)
        );
        assert!(translate(&cond, BackendType::S3).is_err());
        assert!(translate(&cond, BackendType::Azure).is_err());
    }

    #[test]
    fn test_lease_condition_is_azure_only() {
        let cond = WriteCondition::ByLease("f2c3e4a1-0000-4000-8000-000000000001".to_string());
        assert!(matches!(
            translate(&cond, BackendType::Azure).unwrap(),
            NativePrecondition::LeaseId(_)
        ));
        assert!(translate(&cond, BackendType::S3).is_err());
        assert!(translate(&cond, BackendType::Gcs).is_err());
    }

    #[test]
    fn test_malformed_conditions() {
        assert!(matches!(
            translate(&WriteCondition::ByGeneration(-1), BackendType::Gcs),
            Err(StoreError::InvalidCondition(_))
        ));
        assert!(matches!(
            translate(&WriteCondition::ByETag("  ".to_string()), BackendType::S3),
            Err(StoreError::InvalidCondition(_))
        ));
        assert!(matches!(
            translate(&WriteCondition::ByLease(String::new()), BackendType::Azure),
            Err(StoreError::InvalidCondition(_))
        ));
    }

    #[test]
    fn test_classify_precondition_failures() {
        assert_eq!(
            classify_failure(BackendType::S3, Some(412), Some("PreconditionFailed")),
            FailureClass::PreconditionFailed
        );
        assert_eq!(
            classify_failure(BackendType::Gcs, Some(412), Some("conditionNotMet")),
            FailureClass::PreconditionFailed
        );
        assert_eq!(
            classify_failure(BackendType::Azure, Some(412), Some("ConditionNotMet")),
            FailureClass::PreconditionFailed
        );
        assert_eq!(
            classify_failure(BackendType::Azure, Some(409), Some("BlobAlreadyExists")),
            FailureClass::PreconditionFailed
        );
    }

    #[test]
    fn test_classify_lease_failures() {
        for code in [
            "LeaseIdMismatchWithBlobOperation",
            "LeaseIdMissing",
            "LeaseAlreadyPresent",
            "LeaseIdMismatchWithLeaseOperation",
        ] {
            assert_eq!(
                classify_failure(BackendType::Azure, Some(412), Some(code)),
                FailureClass::LeaseConflict,
                "{code}"
            );
        }
    }

    #[test]
    fn test_classify_transient_failures() {
        assert_eq!(
            classify_failure(BackendType::S3, Some(503), Some("SlowDown")),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure(BackendType::Gcs, Some(429), None),
            FailureClass::Transient
        );
        assert_eq!(
            classify_failure(BackendType::Azure, Some(500), None),
            FailureClass::Transient
        );
        assert_eq!(classify_failure(BackendType::S3, None, None), FailureClass::Transient);
        assert_eq!(
            classify_failure(BackendType::S3, Some(409), Some("ConditionalRequestConflict")),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_classify_other_failures() {
        assert_eq!(
            classify_failure(BackendType::Gcs, Some(404), None),
            FailureClass::NotFound
        );
        assert_eq!(
            classify_failure(BackendType::S3, Some(403), Some("AccessDenied")),
            FailureClass::Fatal
        );
        assert_eq!(
            classify_failure(BackendType::Azure, Some(400), Some("InvalidHeaderValue")),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_failure_to_error() {
        let err = failure_to_error(
            FailureClass::PreconditionFailed,
            "primary",
            "ACTIVE",
            "conditional_put",
            Some(412),
            "At least one of the pre-conditions you specified did not hold".to_string(),
        );
        assert!(matches!(err, StoreError::PreconditionFailed { ref key, .. } if key == "ACTIVE"));

        let err = failure_to_error(
            FailureClass::Fatal,
            "primary",
            "ACTIVE",
            "put",
            Some(403),
            "denied".to_string(),
        );
        assert!(matches!(err, StoreError::Backend { status: Some(403), .. }));
    }
}
