use std::sync::Arc;

use chrono::Duration;
use log::warn;

use super::{Agent, Message, NodeCore, Outbox};
use crate::clock::Clock;
use crate::crypto::{Keypair, PublicKey};
use crate::election::Ballot;
use crate::error::ValidationError;
use crate::ledger::VoteLedger;
use crate::state::BallotState;
use crate::transaction::{SignatureOptions, Transaction};

/// Records marked ballots. Trusts its peers and the ballot generator.
pub struct VotingComputer {
    core: NodeCore<Ballot>,
    ballot_generator: Option<PublicKey>,
}

impl VotingComputer {
    pub fn new(keypair: Keypair, genesis: VoteLedger, clock: Arc<dyn Clock>) -> Self {
        VotingComputer {
            core: NodeCore::new(keypair, genesis, clock),
            ballot_generator: None,
        }
    }

    pub fn set_ballot_generator(&mut self, key: PublicKey) {
        self.ballot_generator = Some(key);
    }

    /// Whether an issuance for `ballot_id` is committed or held in a bucket.
    pub fn is_ballot_issued(&self, ballot_id: &str) -> bool {
        self.core.ledger().state_of(ballot_id) == Some(BallotState::Issued)
            || self
                .core
                .pending()
                .chain(self.core.verified())
                .any(|tx| tx.entity_id() == ballot_id && tx.new_state() == BallotState::Issued)
    }
}

impl Agent for VotingComputer {
    type Content = Ballot;

    fn core(&self) -> &NodeCore<Ballot> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore<Ballot> {
        &mut self.core
    }

    fn is_trusted(&self, key: &PublicKey) -> bool {
        self.core.is_peer(key) || self.ballot_generator.as_ref() == Some(key)
    }

    /// Records a filled ballot as used. The transaction stays pending until
    /// the next broadcast.
    fn create_transaction(
        &mut self,
        ballot: Ballot,
        _outbox: &mut Outbox<Ballot>,
    ) -> Result<(), crate::Error> {
        if !ballot.is_filled() {
            return Err(ValidationError::BallotNotFilled(ballot.id().to_string()).into());
        }
        if !self.is_ballot_issued(ballot.id()) {
            return Err(ValidationError::BallotNotIssued(ballot.id().to_string()).into());
        }
        let tx = Transaction::new(
            ballot,
            self.core.keypair(),
            BallotState::Issued,
            BallotState::Used,
            None,
            SignatureOptions::default(),
        )?;
        self.core.admit(tx, true)?;
        Ok(())
    }

    fn broadcast(&mut self, outbox: &mut Outbox<Ballot>) -> Result<usize, crate::Error> {
        self.core.release_batch(outbox)
    }
}

/// A voting computer that timestamps without re-signing. Everything it
/// broadcasts fails signature verification at honest peers.
pub struct AdversaryVotingComputer {
    inner: VotingComputer,
}

impl AdversaryVotingComputer {
    pub fn new(inner: VotingComputer) -> Self {
        AdversaryVotingComputer { inner }
    }

    pub fn is_ballot_issued(&self, ballot_id: &str) -> bool {
        self.inner.is_ballot_issued(ballot_id)
    }
}

impl Agent for AdversaryVotingComputer {
    type Content = Ballot;

    fn core(&self) -> &NodeCore<Ballot> {
        self.inner.core()
    }

    fn core_mut(&mut self) -> &mut NodeCore<Ballot> {
        self.inner.core_mut()
    }

    fn is_trusted(&self, key: &PublicKey) -> bool {
        self.inner.is_trusted(key)
    }

    fn create_transaction(
        &mut self,
        ballot: Ballot,
        outbox: &mut Outbox<Ballot>,
    ) -> Result<(), crate::Error> {
        self.inner.create_transaction(ballot, outbox)
    }

    fn broadcast(&mut self, outbox: &mut Outbox<Ballot>) -> Result<usize, crate::Error> {
        let core = &mut self.inner.core;
        let batch = core.take_own_pending();
        let start = core.now();
        let count = batch.len();
        for (offset, mut tx) in batch.into_iter().enumerate() {
            tx.stamp_unsigned(start + Duration::minutes(offset as i64));
            core.fan_out(Message::Transaction(tx), outbox);
        }
        if count > 0 {
            warn!("{} broadcast {} unsigned stamps", core.fingerprint(), count);
        }
        Ok(count)
    }
}
