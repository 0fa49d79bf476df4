//! Typed failures of engine operations.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::api::OracleError;
use crate::db;
use crate::models::ChallengeStatus;

/// Broad classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before touching storage
    Validation,
    /// Well-formed request the challenge state does not allow
    Precondition,
    NotFound,
    /// Lost a race against another writer of the same challenge
    Consistency,
    Internal,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    #[error("quantity must be positive and within range, got {0}")]
    InvalidQuantity(Decimal),

    #[error("price must be positive and within range, got {0}")]
    InvalidPrice(Decimal),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("no open position in {symbol}")]
    NoPosition { symbol: String },

    #[error("insufficient position in {symbol}: requested {requested}, held {held}")]
    InsufficientPosition {
        symbol: String,
        requested: Decimal,
        held: Decimal,
    },

    #[error("challenge {challenge_id} is {status}, not active")]
    ChallengeNotActive {
        challenge_id: i64,
        status: ChallengeStatus,
    },

    #[error("user {0} has no active challenge")]
    NoActiveChallenge(i64),

    #[error("user {0} already has an active challenge")]
    ActiveChallengeExists(i64),

    #[error("price unavailable for {symbol}: {reason}")]
    PriceUnavailable { symbol: String, reason: String },

    #[error("challenge {0} not found")]
    ChallengeNotFound(i64),

    #[error("plan {0} not found")]
    PlanNotFound(i64),

    #[error("user {0} not found")]
    UserNotFound(i64),

    #[error("no price found for {0}")]
    PriceNotFound(String),

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;

        match self {
            InvalidSymbol(_) | InvalidQuantity(_) | InvalidPrice(_) | InvalidPlan(_) => {
                ErrorKind::Validation
            }
            InsufficientBalance { .. }
            | NoPosition { .. }
            | InsufficientPosition { .. }
            | ChallengeNotActive { .. }
            | NoActiveChallenge(_)
            | ActiveChallengeExists(_)
            | PriceUnavailable { .. } => ErrorKind::Precondition,
            ChallengeNotFound(_) | PlanNotFound(_) | UserNotFound(_) | PriceNotFound(_) => {
                ErrorKind::NotFound
            }
            Conflict(_) => ErrorKind::Consistency,
            Storage(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same operation may succeed if simply run again.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Consistency
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        if db::is_lock_contention(&err) {
            EngineError::Conflict(format!("{:#}", err))
        } else {
            EngineError::Storage(err)
        }
    }
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::NotFound { symbol } => EngineError::PriceNotFound(symbol),
            OracleError::Unavailable { symbol, reason } => {
                EngineError::PriceUnavailable { symbol, reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_classification() {
        assert_eq!(EngineError::InvalidQuantity(dec!(0)).kind(), ErrorKind::Validation);
        assert_eq!(
            EngineError::NoPosition { symbol: "AAPL".to_string() }.kind(),
            ErrorKind::Precondition
        );
        assert_eq!(EngineError::ChallengeNotFound(7).kind(), ErrorKind::NotFound);
        assert!(EngineError::Conflict("race".to_string()).is_retryable());
        assert!(!EngineError::Storage(anyhow::anyhow!("disk full")).is_retryable());
    }

    #[test]
    fn test_oracle_errors_map_to_engine_errors() {
        let err: EngineError = OracleError::NotFound { symbol: "ZZZ".to_string() }.into();
        assert!(matches!(err, EngineError::PriceNotFound(ref s) if s == "ZZZ"));

        let err: EngineError = OracleError::Unavailable {
            symbol: "AAPL".to_string(),
            reason: "timeout".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn test_plain_storage_error_is_internal() {
        let err: EngineError = anyhow::anyhow!("no such table").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
