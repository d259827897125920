use std::sync::Arc;

use super::{Agent, Message, NodeCore, Outbox};
use crate::clock::Clock;
use crate::crypto::Keypair;
use crate::election::Voter;
use crate::ledger::VoterLedger;
use crate::state::VoterState;
use crate::transaction::{SignatureOptions, Transaction};

/// Voter-roll checks a registrar performs before a voter receives a ballot.
pub trait VoterAuthority: Agent<Content = Voter> {
    fn authenticate_voter(&self, voter: &Voter, roll: &[Voter]) -> bool {
        roll.iter().any(|registered| registered == voter)
    }

    fn has_voter_voted(&self, voter: &Voter) -> bool;
}

/// Registers voters as having voted. Voter transactions are signed once,
/// timestamped, and sent the moment they are created.
pub struct VoterComputer {
    core: NodeCore<Voter>,
}

impl VoterComputer {
    pub fn new(keypair: Keypair, genesis: VoterLedger, clock: Arc<dyn Clock>) -> Self {
        VoterComputer {
            core: NodeCore::new(keypair, genesis, clock),
        }
    }
}

impl Agent for VoterComputer {
    type Content = Voter;

    fn core(&self) -> &NodeCore<Voter> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut NodeCore<Voter> {
        &mut self.core
    }

    fn create_transaction(
        &mut self,
        voter: Voter,
        outbox: &mut Outbox<Voter>,
    ) -> Result<(), crate::Error> {
        let tx = Transaction::new(
            voter,
            self.core.keypair(),
            VoterState::NotVoted,
            VoterState::Voted,
            Some(self.core.now()),
            SignatureOptions::default(),
        )?;
        self.core.admit(tx.clone(), true)?;
        self.core.fan_out(Message::Transaction(tx), outbox);
        Ok(())
    }

    /// Re-sends this node's verified, not yet sealed transactions.
    fn broadcast(&mut self, outbox: &mut Outbox<Voter>) -> Result<usize, crate::Error> {
        let own = self.core.public_key().clone();
        let unsealed: Vec<Transaction<Voter>> = self
            .core
            .verified()
            .filter(|tx| tx.issuer() == &own)
            .cloned()
            .collect();
        for tx in &unsealed {
            self.core.fan_out(Message::Transaction(tx.clone()), outbox);
        }
        Ok(unsealed.len())
    }
}

impl VoterAuthority for VoterComputer {
    fn has_voter_voted(&self, voter: &Voter) -> bool {
        self.core.ledger().state_of(&voter.id) == Some(VoterState::Voted)
            || self
                .core
                .pending()
                .chain(self.core.verified())
                .any(|tx| tx.entity_id() == voter.id && tx.new_state() == VoterState::Voted)
    }
}

/// A voter computer that never remembers a vote.
pub struct AdversaryVoterComputer {
    inner: VoterComputer,
}

impl AdversaryVoterComputer {
    pub fn new(inner: VoterComputer) -> Self {
        AdversaryVoterComputer { inner }
    }
}

impl Agent for AdversaryVoterComputer {
    type Content = Voter;

    fn core(&self) -> &NodeCore<Voter> {
        self.inner.core()
    }

    fn core_mut(&mut self) -> &mut NodeCore<Voter> {
        self.inner.core_mut()
    }

    fn create_transaction(
        &mut self,
        voter: Voter,
        outbox: &mut Outbox<Voter>,
    ) -> Result<(), crate::Error> {
        self.inner.create_transaction(voter, outbox)
    }

    fn broadcast(&mut self, outbox: &mut Outbox<Voter>) -> Result<usize, crate::Error> {
        self.inner.broadcast(outbox)
    }
}

impl VoterAuthority for AdversaryVoterComputer {
    fn has_voter_voted(&self, _voter: &Voter) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::tests::keypair;
    use chrono::{TimeZone, Utc};

    fn roll() -> Vec<Voter> {
        vec![Voter::new("Ada", "1"), Voter::new("Grace", "2")]
    }

    fn registrar() -> VoterComputer {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2018, 11, 6, 8, 0, 0).unwrap()));
        let mut registrar = VoterComputer::new(keypair(), VoterLedger::from_roll(&roll()), clock);
        registrar.core_mut().set_peers(vec![keypair().public_key().clone()]);
        registrar
    }

    #[test]
    fn test_authenticate_voter() {
        let registrar = registrar();
        assert!(registrar.authenticate_voter(&Voter::new("Ada", "1"), &roll()));
        assert!(!registrar.authenticate_voter(&Voter::new("Ada", "3"), &roll()));
    }

    #[test]
    fn test_vote_is_sent_immediately() {
        let mut registrar = registrar();
        let ada = Voter::new("Ada", "1");
        assert!(!registrar.has_voter_voted(&ada));

        let mut outbox = Vec::new();
        registrar.create_transaction(ada.clone(), &mut outbox).unwrap();
        assert_eq!(outbox.len(), 1);
        assert!(registrar.has_voter_voted(&ada));
        assert!(!registrar.has_voter_voted(&Voter::new("Grace", "2")));

        // Still unsealed, so a broadcast repeats it.
        assert_eq!(registrar.broadcast(&mut outbox).unwrap(), 1);
        registrar.seal(&mut Vec::new()).unwrap();
        assert!(registrar.has_voter_voted(&ada));
        assert_eq!(registrar.broadcast(&mut Vec::new()).unwrap(), 0);
    }

    #[test]
    fn test_accepts_peer_block_carrying_own_vote() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2018, 11, 6, 8, 0, 0).unwrap()));
        let mut sealer =
            VoterComputer::new(keypair(), VoterLedger::from_roll(&roll()), clock.clone());
        let mut issuer = VoterComputer::new(keypair(), VoterLedger::from_roll(&roll()), clock);
        sealer.core_mut().set_peers(vec![issuer.core().public_key().clone()]);
        issuer.core_mut().set_peers(vec![sealer.core().public_key().clone()]);

        let mut outbox = Vec::new();
        issuer.create_transaction(Voter::new("Ada", "1"), &mut outbox).unwrap();
        for envelope in outbox {
            sealer.receive(envelope.message).unwrap();
        }

        let mut outbox = Vec::new();
        let block = sealer.seal(&mut outbox).unwrap().unwrap();
        assert_eq!(outbox.len(), 1);
        issuer.receive(outbox.remove(0).message).unwrap();
        assert_eq!(issuer.core().chain().head_header(), Some(block.header()));
        assert_eq!(issuer.core().verified().count(), 0);
        assert!(issuer.has_voter_voted(&Voter::new("Ada", "1")));
    }

    #[test]
    fn test_adversary_forgets_votes() {
        let mut rogue = AdversaryVoterComputer::new(registrar());
        let ada = Voter::new("Ada", "1");
        rogue.create_transaction(ada.clone(), &mut Vec::new()).unwrap();
        assert!(!rogue.has_voter_voted(&ada));
        rogue.create_transaction(ada.clone(), &mut Vec::new()).unwrap();
        assert_eq!(rogue.core().verified().count(), 2);
    }
}
