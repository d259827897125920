use thiserror::Error;

use crate::crypto::Fingerprint;

/// Malformed content, disallowed state or untrusted issuer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: &'static str, to: &'static str },
    #[error("unknown state `{0}`")]
    UnknownState(String),
    #[error("issuer {0} is not trusted")]
    UntrustedIssuer(Fingerprint),
    #[error("{signer} cannot re-sign a transaction issued by {issuer}")]
    SignerMismatch {
        signer: Fingerprint,
        issuer: Fingerprint,
    },
    #[error("ballot {0} was never issued")]
    BallotNotIssued(String),
    #[error("ballot {0} is not filled")]
    BallotNotFilled(String),
    #[error("item `{item}` has no choice `{choice}`")]
    UnknownChoice { item: String, choice: String },
    #[error("item `{0}` already holds its maximum number of selections")]
    ItemFull(String),
    #[error("voter {0} is not on the voter roll")]
    NotRegistered(String),
    #[error("voter {0} has already voted")]
    AlreadyVoted(String),
    #[error("no ballots available")]
    NoBallotsAvailable,
    #[error("generated duplicate ballot id {0}")]
    DuplicateBallotId(String),
    #[error("invalid election definition: {0}")]
    InvalidDefinition(String),
    #[error("block ledger hash does not match local replay")]
    LedgerMismatch,
}

/// Recomputed payload does not verify against the claimed signature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signature of {subject} does not verify")]
pub struct SignatureError {
    pub subject: String,
}

impl SignatureError {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

/// A proposed block does not build on the current head.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("block builds on {found} but head is {expected}")]
pub struct ChainIntegrityError {
    pub expected: String,
    pub found: String,
}

/// Outcome of a failed admission. The transaction itself is retained by the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    ChainIntegrity(#[from] ChainIntegrityError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("crypto backend: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
