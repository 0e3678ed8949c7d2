// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    // Config validation failed at startup
    ConfigInvalid(String),
    // Network or RPC failure, retried on the next tick or cycle
    TransientRpc(String),
    // A tx with the same nonce and fees was already sent from this address
    TxAlreadySent(u64),
    // The lowest unconfirmed nonce is above the account nonce; carries the account nonce
    GapNonce(u64),
    // WaitingQuorum exceeded its deadline
    QuorumTimeout(String),
    // The balance validator rejected a transfer
    BalanceMismatch(String),
    // The destination tx was reverted or reported as failed
    ExecutionFailed(String),
    // Bad envelope, bad signature or replayed message from a peer
    PeerProtocolViolation(String),
    // This relayer would sign a second message hash for the same batch
    Equivocation(String),
    // Token has no counterpart on the other chain
    UnknownToken(String),
    // Address failed to parse
    InvalidAddress(String),
    // Byte level decoding failure of chain data
    Decode(String),
    // The referenced transaction does not exist (yet)
    TxNotFound,
    // An outbound call exceeded its deadline
    Timeout(String),
    // Unrecoverable invariant violation; the orchestrator shuts the process down
    Fatal(String),
    // Uncategorized error
    Generic(String),
}

impl BridgeError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::TransientRpc(_) => "transient_rpc",
            BridgeError::TxAlreadySent(_) => "tx_already_sent",
            BridgeError::GapNonce(_) => "gap_nonce",
            BridgeError::QuorumTimeout(_) => "quorum_timeout",
            BridgeError::BalanceMismatch(_) => "balance_mismatch",
            BridgeError::ExecutionFailed(_) => "execution_failed",
            BridgeError::PeerProtocolViolation(_) => "peer_protocol_violation",
            BridgeError::Equivocation(_) => "equivocation",
            BridgeError::UnknownToken(_) => "unknown_token",
            BridgeError::InvalidAddress(_) => "invalid_address",
            BridgeError::Decode(_) => "decode_error",
            BridgeError::TxNotFound => "tx_not_found",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::Fatal(_) => "fatal",
            BridgeError::Generic(_) => "generic",
        }
    }

    /// Errors that leave a state machine where it was; the next tick retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientRpc(_)
                | BridgeError::Timeout(_)
                | BridgeError::TxNotFound
                | BridgeError::GapNonce(_)
                | BridgeError::TxAlreadySent(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Fatal(_))
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::TxNotFound => write!(f, "transaction not found"),
            BridgeError::TxAlreadySent(nonce) => write!(
                f,
                "transaction with nonce {} and the same fees was already sent",
                nonce
            ),
            BridgeError::GapNonce(nonce) => write!(f, "nonce gap detected, account nonce {}", nonce),
            BridgeError::ConfigInvalid(msg)
            | BridgeError::TransientRpc(msg)
            | BridgeError::QuorumTimeout(msg)
            | BridgeError::BalanceMismatch(msg)
            | BridgeError::ExecutionFailed(msg)
            | BridgeError::PeerProtocolViolation(msg)
            | BridgeError::Equivocation(msg)
            | BridgeError::UnknownToken(msg)
            | BridgeError::InvalidAddress(msg)
            | BridgeError::Decode(msg)
            | BridgeError::Timeout(msg)
            | BridgeError::Fatal(msg)
            | BridgeError::Generic(msg) => write!(f, "{}: {}", self.error_type(), msg),
        }
    }
}

impl<E> From<E> for BridgeError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Generic(err.into().to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_valid_prometheus_labels() {
        let errors = vec![
            BridgeError::ConfigInvalid("x".to_string()),
            BridgeError::TransientRpc("x".to_string()),
            BridgeError::TxAlreadySent(1),
            BridgeError::GapNonce(99),
            BridgeError::QuorumTimeout("x".to_string()),
            BridgeError::BalanceMismatch("x".to_string()),
            BridgeError::ExecutionFailed("x".to_string()),
            BridgeError::PeerProtocolViolation("x".to_string()),
            BridgeError::Equivocation("x".to_string()),
            BridgeError::UnknownToken("x".to_string()),
            BridgeError::InvalidAddress("x".to_string()),
            BridgeError::Decode("x".to_string()),
            BridgeError::TxNotFound,
            BridgeError::Timeout("x".to_string()),
            BridgeError::Fatal("x".to_string()),
            BridgeError::Generic("x".to_string()),
        ];

        for error in errors {
            let error_type = error.error_type();
            assert!(!error_type.is_empty());
            for c in error_type.chars() {
                assert!(
                    c.is_ascii_lowercase() || c == '_',
                    "error_type '{}' contains invalid character '{}'",
                    error_type,
                    c
                );
            }
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::TransientRpc("connection reset".to_string()).is_transient());
        assert!(BridgeError::Timeout("vm query".to_string()).is_transient());
        assert!(BridgeError::GapNonce(4).is_transient());
        assert!(!BridgeError::BalanceMismatch("x".to_string()).is_transient());
        assert!(!BridgeError::ExecutionFailed("x".to_string()).is_transient());
        assert!(!BridgeError::Fatal("x".to_string()).is_transient());
        assert!(BridgeError::Fatal("x".to_string()).is_fatal());
    }

    #[test]
    fn test_anyhow_conversion_is_generic() {
        fn parse() -> BridgeResult<u64> {
            Ok("not a number".parse::<u64>()?)
        }
        assert!(matches!(parse(), Err(BridgeError::Generic(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            BridgeError::GapNonce(99).to_string(),
            "nonce gap detected, account nonce 99"
        );
        assert_eq!(
            BridgeError::QuorumTimeout("batch 3".to_string()).to_string(),
            "quorum_timeout: batch 3"
        );
    }
}
