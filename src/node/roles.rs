use std::sync::Arc;

use super::{
    AdversaryVoterComputer, AdversaryVotingComputer, Agent, BallotGenerator, Bucket, Message,
    NodeCore, Outbox, VoterAuthority, VoterComputer, VotingComputer,
};
use crate::block::Block;
use crate::crypto::PublicKey;
use crate::election::{Ballot, Voter};
use crate::error::AdmissionError;
use crate::transaction::Transaction;

/// Every member of a vote network.
pub enum BallotAgent {
    Generator(BallotGenerator),
    Booth(VotingComputer),
    RogueBooth(AdversaryVotingComputer),
}

impl BallotAgent {
    fn inner(&self) -> &dyn Agent<Content = Ballot> {
        match self {
            BallotAgent::Generator(node) => node,
            BallotAgent::Booth(node) => node,
            BallotAgent::RogueBooth(node) => node,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Agent<Content = Ballot> {
        match self {
            BallotAgent::Generator(node) => node,
            BallotAgent::Booth(node) => node,
            BallotAgent::RogueBooth(node) => node,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            BallotAgent::Generator(_) => "ballot generator",
            BallotAgent::Booth(_) => "voting computer",
            BallotAgent::RogueBooth(_) => "adversary voting computer",
        }
    }
}

impl Agent for BallotAgent {
    type Content = Ballot;

    fn core(&self) -> &NodeCore<Ballot> {
        self.inner().core()
    }

    fn core_mut(&mut self) -> &mut NodeCore<Ballot> {
        self.inner_mut().core_mut()
    }

    fn is_trusted(&self, key: &PublicKey) -> bool {
        self.inner().is_trusted(key)
    }

    fn admit(&mut self, tx: Transaction<Ballot>) -> Result<Bucket, AdmissionError> {
        self.inner_mut().admit(tx)
    }

    fn create_transaction(
        &mut self,
        ballot: Ballot,
        outbox: &mut Outbox<Ballot>,
    ) -> Result<(), crate::Error> {
        self.inner_mut().create_transaction(ballot, outbox)
    }

    fn broadcast(&mut self, outbox: &mut Outbox<Ballot>) -> Result<usize, crate::Error> {
        self.inner_mut().broadcast(outbox)
    }

    fn seal(
        &mut self,
        outbox: &mut Outbox<Ballot>,
    ) -> Result<Option<Arc<Block<Ballot>>>, crate::Error> {
        self.inner_mut().seal(outbox)
    }

    fn receive(&mut self, message: Message<Ballot>) -> Result<(), crate::Error> {
        self.inner_mut().receive(message)
    }
}

/// Every member of a voter network.
pub enum VoterAgent {
    Registrar(VoterComputer),
    RogueRegistrar(AdversaryVoterComputer),
}

impl VoterAgent {
    fn inner(&self) -> &dyn VoterAuthority {
        match self {
            VoterAgent::Registrar(node) => node,
            VoterAgent::RogueRegistrar(node) => node,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn VoterAuthority {
        match self {
            VoterAgent::Registrar(node) => node,
            VoterAgent::RogueRegistrar(node) => node,
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            VoterAgent::Registrar(_) => "voter computer",
            VoterAgent::RogueRegistrar(_) => "adversary voter computer",
        }
    }
}

impl Agent for VoterAgent {
    type Content = Voter;

    fn core(&self) -> &NodeCore<Voter> {
        self.inner().core()
    }

    fn core_mut(&mut self) -> &mut NodeCore<Voter> {
        self.inner_mut().core_mut()
    }

    fn is_trusted(&self, key: &PublicKey) -> bool {
        self.inner().is_trusted(key)
    }

    fn admit(&mut self, tx: Transaction<Voter>) -> Result<Bucket, AdmissionError> {
        self.inner_mut().admit(tx)
    }

    fn create_transaction(
        &mut self,
        voter: Voter,
        outbox: &mut Outbox<Voter>,
    ) -> Result<(), crate::Error> {
        self.inner_mut().create_transaction(voter, outbox)
    }

    fn broadcast(&mut self, outbox: &mut Outbox<Voter>) -> Result<usize, crate::Error> {
        self.inner_mut().broadcast(outbox)
    }

    fn seal(
        &mut self,
        outbox: &mut Outbox<Voter>,
    ) -> Result<Option<Arc<Block<Voter>>>, crate::Error> {
        self.inner_mut().seal(outbox)
    }

    fn receive(&mut self, message: Message<Voter>) -> Result<(), crate::Error> {
        self.inner_mut().receive(message)
    }
}

impl VoterAuthority for VoterAgent {
    fn authenticate_voter(&self, voter: &Voter, roll: &[Voter]) -> bool {
        self.inner().authenticate_voter(voter, roll)
    }

    fn has_voter_voted(&self, voter: &Voter) -> bool {
        self.inner().has_voter_voted(voter)
    }
}
