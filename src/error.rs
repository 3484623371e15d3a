//! Error Handling Module
//!
//! # Design Decision
//!
//! 2계층 에러 전략:
//!    1. `PorError`: thiserror 기반 도메인 에러 타입, 어떤 실패인지 분류
//!    2. `anyhow`: 앱 레벨 에러 전파 (서비스/바이너리에서 `.context()` 체인)
//!
//! Every fatal kind terminates the process after one explanatory line
//! (binaries return `anyhow::Result`, so the chain prints once). Transient
//! kinds are logged and retried at the call site; input validation errors are
//! aggregated per file and surfaced once at end of input.

use thiserror::Error;

/// 도메인 에러 타입
///
/// Variants follow the failure taxonomy of the pipeline:
/// invalid input rows, broken configuration invariants, transient storage
/// trouble, cryptographic failures, Merkle state divergence and arithmetic
/// overflow.
#[derive(Debug, Error)]
pub enum PorError {
    // ============ recoverable by skipping / aggregation ============
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ============ fatal, no retry ============
    #[error("config invariant violated: {0}")]
    ConfigInvariant(String),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("merkle state mismatch: {0}")]
    MerkleMismatch(String),

    #[error("u64 overflow while accumulating {0}")]
    Overflow(&'static str),

    // ============ transient, retried by the caller ============
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("record not found")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, PorError>;

/// Checked u64 addition for exchange-wide totals.
///
/// 거래소 총액은 u64 를 넘을 수 없음: 넘치면 즉시 치명적 에러
pub fn safe_add(a: u64, b: u64, what: &'static str) -> Result<u64> {
    a.checked_add(b).ok_or(PorError::Overflow(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_add() {
        assert_eq!(safe_add(1, 2, "equity").unwrap(), 3);
        assert!(matches!(
            safe_add(u64::MAX, 1, "equity"),
            Err(PorError::Overflow("equity"))
        ));
    }
}
