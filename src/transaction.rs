//! Signed state transitions.
//!
//! A transaction commits to `content:previous_state:new_state[:timestamp]`.
//! Ballot transactions start untimestamped and are later stamped and re-signed
//! in batches, so every transaction of a batch carries the same time.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::format_time;
use crate::crypto::{Keypair, PublicKey, Signature};
use crate::election::{Ballot, ChoiceKey, Voter};
use crate::error::{SignatureError, ValidationError};
use crate::models::TransactionRecord;
use crate::state::EntityState;

/// Controls which parts of the content enter the signed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureOptions {
    /// Whether ballot marks are signed. Issuances are signed blank so the
    /// ballot can be marked afterwards.
    pub include_chosen: bool,
}

impl Default for SignatureOptions {
    fn default() -> Self {
        SignatureOptions { include_chosen: true }
    }
}

/// Something whose state is tracked by a ledger.
pub trait Content: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    type State: EntityState;

    const KIND: &'static str;

    /// Whether transactions are created untimestamped and re-signed in batches.
    const TWO_PHASE: bool = false;

    /// Ledger key of the entity.
    fn entity_id(&self) -> &str;

    /// Canonical representation entering the signed payload.
    fn signature_contents(&self, options: SignatureOptions) -> String;

    /// Choices counted when the entity reaches its terminal state.
    fn selected_choices(&self) -> Vec<ChoiceKey> {
        Vec::new()
    }
}

#[derive(Clone)]
pub struct Transaction<C: Content> {
    content: Arc<C>,
    issuer: PublicKey,
    previous_state: C::State,
    new_state: C::State,
    timestamp: Option<DateTime<Utc>>,
    options: SignatureOptions,
    signature: Signature,
}

pub type VoteTransaction = Transaction<Ballot>;
pub type VoterTransaction = Transaction<Voter>;

impl<C: Content> Transaction<C> {
    /// Builds and signs a transaction. Fails on an edge the state set does not allow.
    pub fn new(
        content: C,
        signer: &Keypair,
        previous_state: C::State,
        new_state: C::State,
        timestamp: Option<DateTime<Utc>>,
        options: SignatureOptions,
    ) -> Result<Self, crate::Error> {
        if !C::State::is_legal(previous_state, new_state) {
            return Err(ValidationError::IllegalTransition {
                from: previous_state.as_str(),
                to: new_state.as_str(),
            }
            .into());
        }
        let mut transaction = Transaction {
            content: Arc::new(content),
            issuer: signer.public_key().clone(),
            previous_state,
            new_state,
            timestamp,
            options,
            signature: Signature::default(),
        };
        transaction.signature = signer.sign(transaction.signature_contents().as_bytes())?;
        Ok(transaction)
    }

    pub fn content(&self) -> &C {
        &self.content
    }

    pub fn entity_id(&self) -> &str {
        self.content.entity_id()
    }

    pub fn issuer(&self) -> &PublicKey {
        &self.issuer
    }

    pub fn previous_state(&self) -> C::State {
        self.previous_state
    }

    pub fn new_state(&self) -> C::State {
        self.new_state
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn is_timestamped(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn options(&self) -> SignatureOptions {
        self.options
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Canonical payload, recomputed from the current fields.
    pub fn signature_contents(&self) -> String {
        let mut parts = vec![
            self.content.signature_contents(self.options),
            self.previous_state.as_str().to_string(),
            self.new_state.as_str().to_string(),
        ];
        if let Some(at) = &self.timestamp {
            parts.push(format_time(at));
        }
        parts.join(":")
    }

    pub fn verify(&self) -> bool {
        self.issuer.verify(self.signature_contents().as_bytes(), &self.signature)
    }

    pub fn check(&self) -> Result<(), SignatureError> {
        if self.verify() {
            Ok(())
        } else {
            Err(SignatureError::new(format!("{} {}", C::KIND, self.entity_id())))
        }
    }

    /// Same issuer, entity and edge; `other` may differ only in its signing phase.
    pub fn is_copy_of(&self, other: &Self) -> bool {
        self.issuer == other.issuer
            && self.entity_id() == other.entity_id()
            && self.previous_state == other.previous_state
            && self.new_state == other.new_state
    }

    /// Sets a timestamp without producing a new signature. The result no
    /// longer verifies; only misbehaving nodes have a use for this.
    pub(crate) fn stamp_unsigned(&mut self, at: DateTime<Utc>) {
        self.timestamp = Some(at);
    }

    pub fn record(&self) -> TransactionRecord {
        TransactionRecord {
            kind: C::KIND.to_string(),
            entity: self.entity_id().to_string(),
            issuer: self.issuer.fingerprint(),
            previous_state: self.previous_state.as_str().to_string(),
            new_state: self.new_state.as_str().to_string(),
            timestamp: self.timestamp.as_ref().map(format_time),
            signature: self.signature.to_base64(),
        }
    }
}

impl Transaction<Ballot> {
    /// Second signing phase: attach `at` and re-sign the extended payload,
    /// superseding the untimestamped signature. Only the issuer may do this.
    pub fn stamp(&mut self, at: DateTime<Utc>, signer: &Keypair) -> Result<(), crate::Error> {
        if signer.public_key() != &self.issuer {
            return Err(ValidationError::SignerMismatch {
                signer: signer.fingerprint(),
                issuer: self.issuer.fingerprint(),
            }
            .into());
        }
        self.timestamp = Some(at);
        self.signature = signer.sign(self.signature_contents().as_bytes())?;
        Ok(())
    }
}

/// Stamps every transaction of `batch` with the same instant and re-signs it.
pub fn timestamp_and_sign<'a>(
    batch: impl IntoIterator<Item = &'a mut VoteTransaction>,
    at: DateTime<Utc>,
    signer: &Keypair,
) -> Result<(), crate::Error> {
    for transaction in batch {
        transaction.stamp(at, signer)?;
    }
    Ok(())
}

impl<C: Content> PartialEq for Transaction<C> {
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl<C: Content> Eq for Transaction<C> {}

impl<C: Content> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &C::KIND)
            .field("entity", &self.entity_id())
            .field("issuer", &self.issuer.fingerprint())
            .field("edge", &format_args!("{} -> {}", self.previous_state, self.new_state))
            .field("timestamp", &self.timestamp)
            .field("signature", &self.signature)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::keypair;
    use crate::election::tests::items;
    use crate::state::{BallotState, VoterState};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 11, 6, 9, minute, 0).unwrap()
    }

    #[test]
    fn test_voter_transaction_verifies() {
        let node = keypair();
        let tx = Transaction::new(
            Voter::new("Ada", "1"),
            &node,
            VoterState::NotVoted,
            VoterState::Voted,
            Some(at(0)),
            SignatureOptions::default(),
        )
        .unwrap();
        assert!(tx.verify());
        assert_eq!(tx.signature_contents(), "1:not voted:voted:2018-11-06 09:00");
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let node = keypair();
        let err = Transaction::new(
            Ballot::new("b1", "E", items()),
            &node,
            BallotState::Created,
            BallotState::Used,
            None,
            SignatureOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::IllegalTransition {
                from: "ballot_created",
                to: "ballot_used"
            })
        ));
    }

    #[test]
    fn test_tampered_content_fails_verification() {
        let node = keypair();
        let mut tx = Transaction::new(
            Voter::new("Ada", "1"),
            &node,
            VoterState::NotVoted,
            VoterState::Voted,
            Some(at(0)),
            SignatureOptions::default(),
        )
        .unwrap();
        tx.content = Arc::new(Voter::new("Ada", "2"));
        assert!(!tx.verify());
        assert!(tx.check().is_err());
    }

    #[test]
    fn test_two_phase_signing() {
        let node = keypair();
        let mut ballot = Ballot::new("b1", "E", items());
        ballot.select(&ChoiceKey::new("President", "X")).unwrap();
        ballot.select(&ChoiceKey::new("Vice President", "V1")).unwrap();

        let mut tx = Transaction::new(
            ballot,
            &node,
            BallotState::Issued,
            BallotState::Used,
            None,
            SignatureOptions::default(),
        )
        .unwrap();
        let first = tx.signature().clone();
        assert!(tx.verify());
        assert!(!tx.is_timestamped());

        tx.stamp(at(30), &node).unwrap();
        assert!(tx.is_timestamped());
        assert_ne!(tx.signature(), &first);
        assert!(tx.verify());
        assert!(tx.signature_contents().ends_with(":ballot_issued:ballot_used:2018-11-06 09:30"));
    }

    #[test]
    fn test_stamp_requires_issuer() {
        let issuer = keypair();
        let other = keypair();
        let mut tx = Transaction::new(
            Ballot::new("b1", "E", items()),
            &issuer,
            BallotState::Created,
            BallotState::Issued,
            None,
            SignatureOptions { include_chosen: false },
        )
        .unwrap();
        assert!(matches!(
            tx.stamp(at(1), &other),
            Err(crate::Error::Validation(ValidationError::SignerMismatch { .. }))
        ));
        assert!(!tx.is_timestamped());
    }

    #[test]
    fn test_batch_shares_timestamp() {
        let node = keypair();
        let mut batch: Vec<_> = ["b1", "b2"]
            .iter()
            .map(|id| {
                Transaction::new(
                    Ballot::new(*id, "E", items()),
                    &node,
                    BallotState::Created,
                    BallotState::Issued,
                    None,
                    SignatureOptions { include_chosen: false },
                )
                .unwrap()
            })
            .collect();
        timestamp_and_sign(batch.iter_mut(), at(45), &node).unwrap();
        assert!(batch.iter().all(|tx| tx.timestamp() == Some(at(45)) && tx.verify()));
    }

    #[test]
    fn test_unsigned_stamp_breaks_signature() {
        let node = keypair();
        let mut tx = Transaction::new(
            Ballot::new("b1", "E", items()),
            &node,
            BallotState::Created,
            BallotState::Issued,
            None,
            SignatureOptions { include_chosen: false },
        )
        .unwrap();
        tx.stamp_unsigned(at(2));
        assert!(!tx.verify());
    }

    #[test]
    fn test_issuance_survives_marking() {
        let node = keypair();
        let blank = Ballot::new("b1", "E", items());
        let tx = Transaction::new(
            blank.clone(),
            &node,
            BallotState::Created,
            BallotState::Issued,
            None,
            SignatureOptions { include_chosen: false },
        )
        .unwrap();
        let mut marked = blank;
        marked.select(&ChoiceKey::new("President", "Y")).unwrap();
        assert_eq!(
            marked.signature_contents(tx.options()),
            tx.content().signature_contents(tx.options())
        );
    }
}
