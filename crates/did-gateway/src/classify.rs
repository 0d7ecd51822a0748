//! Maps transport statuses and application error codes to retry verdicts.

use std::time::Duration;

use tonic::{Code, Status};

use crate::error::GatewayError;
use crate::types::{RegisterErrorCode, TxReceipt};

/// Outcome of one attempt as seen by the retry engine.
#[derive(Debug)]
pub enum Verdict {
    Success(TxReceipt),
    /// Not a fresh registration, but the caller's goal is met.
    SuccessEquivalent(TxReceipt),
    Retryable(RetryCause),
    Fatal(GatewayError),
}

/// Classification of a failed attempt.
#[derive(Debug)]
pub enum Failure {
    Retryable(RetryCause),
    Fatal(GatewayError),
}

impl From<Failure> for Verdict {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Retryable(cause) => Verdict::Retryable(cause),
            Failure::Fatal(err) => Verdict::Fatal(err),
        }
    }
}

/// Why an attempt may be retried. Decides the error surfaced on exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    /// Gateway unreachable (`UNAVAILABLE`).
    Connection(String),
    /// Transient server-side failure.
    Transient(String),
}

impl RetryCause {
    pub fn message(&self) -> &str {
        match self {
            Self::Connection(m) | Self::Transient(m) => m,
        }
    }

    /// Code of the error this cause turns into on exhaustion.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "E_CONNECTION",
            Self::Transient(_) => "E_GATEWAY",
        }
    }

    /// Diagnostics kind for a failed attempt that will be retried. Kept apart
    /// from [`Self::code`] so the final error is not suppressed by earlier
    /// retry warnings.
    pub fn retry_kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "retry:E_CONNECTION",
            Self::Transient(_) => "retry:E_GATEWAY",
        }
    }

    /// Error returned when the retry budget runs out with this as the last failure.
    pub fn into_exhausted_error(self, attempts: u32) -> GatewayError {
        match self {
            Self::Connection(message) => GatewayError::Connection {
                message: format!("{} (after {} attempts)", message, attempts),
            },
            Self::Transient(message) => GatewayError::Gateway {
                message: format!("{} (after {} attempts)", message, attempts),
                transient: true,
            },
        }
    }
}

/// Classify a gRPC status.
pub fn classify_status(status: &Status, timeout: Duration) -> Failure {
    let detail = status.message();
    match status.code() {
        Code::DeadlineExceeded => Failure::Fatal(GatewayError::Timeout {
            timeout,
            message: non_empty(detail, "deadline exceeded"),
        }),
        Code::Unavailable => Failure::Retryable(RetryCause::Connection(format!(
            "gateway service unavailable: {}",
            non_empty(detail, "no details")
        ))),
        Code::ResourceExhausted | Code::Internal | Code::Unknown => {
            Failure::Retryable(RetryCause::Transient(format!(
                "gateway returned {:?}: {}",
                status.code(),
                non_empty(detail, "no details")
            )))
        }
        other => Failure::Fatal(GatewayError::Gateway {
            message: format!("gRPC error {:?}: {}", other, non_empty(detail, "no details")),
            transient: false,
        }),
    }
}

/// Classification of a local per-attempt timeout.
pub fn classify_local_timeout(timeout: Duration) -> Failure {
    Failure::Fatal(GatewayError::Timeout {
        timeout,
        message: "no response before the per-attempt deadline".to_string(),
    })
}

/// Classify a receipt the gateway returned.
pub fn classify_receipt(receipt: TxReceipt) -> Verdict {
    if receipt.success {
        return Verdict::Success(receipt);
    }

    let message = non_empty(&receipt.error, "no error message from gateway");
    match receipt.error_code {
        RegisterErrorCode::AlreadyRegistered => Verdict::SuccessEquivalent(receipt),
        RegisterErrorCode::DidQuotaExceeded => {
            Verdict::Fatal(GatewayError::QuotaExceeded { message })
        }
        code @ (RegisterErrorCode::InvalidDid
        | RegisterErrorCode::DocCidEmpty
        | RegisterErrorCode::InvalidDocCid
        | RegisterErrorCode::Unauthorized
        | RegisterErrorCode::InvalidPayload
        | RegisterErrorCode::InvalidOperator) => {
            Verdict::Fatal(GatewayError::Response { code, message })
        }
        code @ (RegisterErrorCode::ProcessingError | RegisterErrorCode::UnknownUnspecified) => {
            Verdict::Retryable(RetryCause::Transient(format!(
                "gateway reported {}: {}",
                code, message
            )))
        }
    }
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn failed(code: RegisterErrorCode) -> TxReceipt {
        TxReceipt {
            hash: "0x01".into(),
            gas_used: 0,
            success: false,
            error: "boom".into(),
            error_code: code,
        }
    }

    #[test]
    fn test_status_table() {
        assert!(matches!(
            classify_status(&Status::deadline_exceeded("slow"), TIMEOUT),
            Failure::Fatal(GatewayError::Timeout { .. })
        ));
        assert!(matches!(
            classify_status(&Status::unavailable("down"), TIMEOUT),
            Failure::Retryable(RetryCause::Connection(_))
        ));
        for status in [
            Status::resource_exhausted("busy"),
            Status::internal("oops"),
            Status::unknown("?"),
        ] {
            assert!(matches!(
                classify_status(&status, TIMEOUT),
                Failure::Retryable(RetryCause::Transient(_))
            ));
        }
        for status in [
            Status::invalid_argument("bad"),
            Status::unauthenticated("who"),
            Status::permission_denied("no"),
            Status::not_found("gone"),
        ] {
            match classify_status(&status, TIMEOUT) {
                Failure::Fatal(err @ GatewayError::Gateway { .. }) => assert!(!err.is_retryable()),
                other => panic!("unexpected classification for {status:?}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_local_timeout_is_fatal() {
        let verdict = classify_local_timeout(TIMEOUT);
        assert!(matches!(
            verdict,
            Failure::Fatal(GatewayError::Timeout { timeout, .. }) if timeout == TIMEOUT
        ));
    }

    #[test]
    fn test_receipt_table() {
        let ok = TxReceipt {
            success: true,
            error: String::new(),
            ..failed(RegisterErrorCode::UnknownUnspecified)
        };
        assert!(matches!(classify_receipt(ok), Verdict::Success(_)));

        assert!(matches!(
            classify_receipt(failed(RegisterErrorCode::AlreadyRegistered)),
            Verdict::SuccessEquivalent(_)
        ));
        assert!(matches!(
            classify_receipt(failed(RegisterErrorCode::DidQuotaExceeded)),
            Verdict::Fatal(GatewayError::QuotaExceeded { .. })
        ));

        for code in [
            RegisterErrorCode::InvalidDid,
            RegisterErrorCode::DocCidEmpty,
            RegisterErrorCode::InvalidDocCid,
            RegisterErrorCode::Unauthorized,
            RegisterErrorCode::InvalidPayload,
            RegisterErrorCode::InvalidOperator,
        ] {
            match classify_receipt(failed(code)) {
                Verdict::Fatal(GatewayError::Response { code: got, .. }) => assert_eq!(got, code),
                other => panic!("unexpected verdict for {code}: {other:?}"),
            }
        }

        for code in [
            RegisterErrorCode::ProcessingError,
            RegisterErrorCode::UnknownUnspecified,
        ] {
            assert!(matches!(
                classify_receipt(failed(code)),
                Verdict::Retryable(RetryCause::Transient(_))
            ));
        }
    }

    #[test]
    fn test_exhausted_error_kind() {
        let cause = RetryCause::Connection("down".into());
        assert_eq!(cause.code(), "E_CONNECTION");
        assert_eq!(cause.retry_kind(), "retry:E_CONNECTION");
        let err = cause.into_exhausted_error(4);
        assert!(matches!(err, GatewayError::Connection { .. }));
        assert_eq!(err.code(), "E_CONNECTION");
        assert!(err.to_string().contains("after 4 attempts"));

        let err = RetryCause::Transient("busy".into()).into_exhausted_error(4);
        assert!(matches!(err, GatewayError::Gateway { .. }));
        assert!(err.is_retryable());
    }
}
