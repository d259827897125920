use std::collections::BTreeMap;
use std::sync::Arc;

use log::info;
use rand::rngs::StdRng;
use rand::Rng;

use super::{Agent, Message, NodeCore, Outbox};
use crate::clock::Clock;
use crate::crypto::Keypair;
use crate::election::Ballot;
use crate::error::ValidationError;
use crate::ledger::VoteLedger;
use crate::state::BallotState;
use crate::transaction::{Content, SignatureOptions, Transaction};

/// Holds the blank ballot stock and hands ballots out one at a time.
pub struct BallotGenerator {
    core: NodeCore<Ballot>,
    ballots: BTreeMap<String, Ballot>,
    available: Vec<String>,
    rng: StdRng,
}

impl BallotGenerator {
    pub fn new(keypair: Keypair, ballots: Vec<Ballot>, clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        let core = NodeCore::new(keypair, VoteLedger::from_ballots(&ballots), clock);
        let available = ballots.iter().map(|ballot| ballot.id().to_string()).collect();
        BallotGenerator {
            core,
            ballots: ballots
                .into_iter()
                .map(|ballot| (ballot.id().to_string(), ballot))
                .collect(),
            available,
            rng,
        }
    }

    pub fn are_ballots_available(&self) -> bool {
        !self.available.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.available.len()
    }

    /// Whether `ballot` is one of ours, judged on its blank content.
    pub fn is_legitimate_ballot(&self, ballot: &Ballot) -> bool {
        let blank = SignatureOptions { include_chosen: false };
        self.ballots
            .get(ballot.id())
            .map_or(false, |master| {
                master.signature_contents(blank) == ballot.signature_contents(blank)
            })
    }

    /// Takes a random ballot out of the stock and issues it. The issuance
    /// stays pending until the next broadcast stamps it.
    pub fn retrieve_ballot(&mut self, outbox: &mut Outbox<Ballot>) -> Result<Ballot, crate::Error> {
        if self.available.is_empty() {
            return Err(ValidationError::NoBallotsAvailable.into());
        }
        let index = self.rng.gen_range(0..self.available.len());
        let id = self.available.swap_remove(index);
        let ballot = self
            .ballots
            .get(&id)
            .cloned()
            .ok_or(ValidationError::NoBallotsAvailable)?;
        self.create_transaction(ballot.clone(), outbox)?;
        info!("issued ballot {} ({} left)", id, self.available.len());
        Ok(ballot)
    }
}

impl Agent for BallotGenerator {
    type Content = Ballot;

    fn core(&self) -> &NodeCore<Ballot> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore<Ballot> {
        &mut self.core
    }

    fn create_transaction(
        &mut self,
        ballot: Ballot,
        outbox: &mut Outbox<Ballot>,
    ) -> Result<(), crate::Error> {
        let tx = Transaction::new(
            ballot,
            self.core.keypair(),
            BallotState::Created,
            BallotState::Issued,
            None,
            SignatureOptions { include_chosen: false },
        )?;
        self.core.admit(tx.clone(), true)?;
        self.core.fan_out(Message::Transaction(tx), outbox);
        Ok(())
    }

    fn broadcast(&mut self, outbox: &mut Outbox<Ballot>) -> Result<usize, crate::Error> {
        self.core.release_batch(outbox)
    }
}
