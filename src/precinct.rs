//! A polling place: one ballot generator, a mesh of voting computers and a
//! separate mesh of voter computers, driven voter by voter and round by round.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::clock::{Clock, IdGenerator};
use crate::crypto::{Fingerprint, Keypair, DEFAULT_KEY_BITS};
use crate::election::{generate_ballots, Ballot, ChoiceKey, ElectionDefinition, Voter};
use crate::error::ValidationError;
use crate::ledger::{StateConflictError, VoteLedger, VoterLedger};
use crate::models::{BlockRecord, LedgerSummary, TransactionRecord};
use crate::network::{total, Delivery, Network};
use crate::node::{
    AdversaryVoterComputer, AdversaryVotingComputer, Agent, BallotAgent, BallotGenerator,
    VoterAgent, VoterAuthority, VoterComputer, VotingComputer,
};
use crate::state::{BallotState, VoterState};
use crate::transaction::Content;

#[derive(Debug, Clone)]
pub struct PrecinctConfig {
    pub voting_computers: usize,
    pub voter_computers: usize,
    pub adversary_voting_computers: usize,
    pub adversary_voter_computers: usize,
    pub key_bits: u32,
    pub seed: Option<u64>,
    /// Ballot generator identity; generated when absent.
    pub issuer_key: Option<Keypair>,
}

impl Default for PrecinctConfig {
    fn default() -> Self {
        PrecinctConfig {
            voting_computers: 5,
            voter_computers: 5,
            adversary_voting_computers: 0,
            adversary_voter_computers: 0,
            key_bits: DEFAULT_KEY_BITS,
            seed: None,
            issuer_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub voter: String,
    pub ballot: String,
    pub voter_computer: Fingerprint,
    pub voting_computer: Fingerprint,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub ballot_transactions: usize,
    pub voter_transactions: usize,
    pub vote_block: Option<BlockRecord>,
    pub voter_block: Option<BlockRecord>,
    pub vote_delivery: Delivery,
    pub voter_delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionEntry {
    pub node: Fingerprint,
    pub role: &'static str,
    pub transaction: TransactionRecord,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub rejected: Vec<RejectionEntry>,
    pub conflicts: Vec<StateConflictError>,
    pub ballots_used: u64,
    pub voters_voted: u64,
    /// Used ballots equal voters who voted and every replica agrees.
    pub consistent: bool,
    pub vote_chain_height: usize,
    pub voter_chain_height: usize,
}

pub struct Precinct {
    definition: ElectionDefinition,
    ballots: Network<BallotAgent>,
    voters: Network<VoterAgent>,
    generator: Fingerprint,
    booths: Vec<Fingerprint>,
    registrars: Vec<Fingerprint>,
    vote_genesis: Arc<VoteLedger>,
    voter_genesis: Arc<VoterLedger>,
    paper_trail: Vec<Ballot>,
    rng: StdRng,
    round: u64,
}

impl Precinct {
    /// Generates one ballot per registered voter, keys for every node, and
    /// wires the trust mappings.
    pub fn setup(
        definition: ElectionDefinition,
        config: PrecinctConfig,
        clock: Arc<dyn Clock>,
        ids: &mut dyn IdGenerator,
    ) -> Result<Self, crate::Error> {
        definition.validate()?;
        let booth_count = config.voting_computers + config.adversary_voting_computers;
        let registrar_count = config.voter_computers + config.adversary_voter_computers;
        if booth_count == 0 || registrar_count == 0 {
            return Err(ValidationError::InvalidDefinition(
                "a precinct needs at least one voting computer and one voter computer".to_string(),
            )
            .into());
        }
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let stock = generate_ballots(
            &definition.name,
            &definition.items,
            definition.voter_roll.len(),
            ids,
        )?;
        let vote_genesis = VoteLedger::from_ballots(&stock).with_choices(definition.choice_keys());
        let voter_genesis = VoterLedger::from_roll(&definition.voter_roll);

        let generator_key = match config.issuer_key {
            Some(key) => key,
            None => Keypair::generate(config.key_bits)?,
        };
        let generator_public = generator_key.public_key().clone();

        let mut ballots = Network::new();
        let mut booths = Vec::with_capacity(booth_count);
        for n in 0..booth_count {
            let mut booth = VotingComputer::new(
                Keypair::generate(config.key_bits)?,
                vote_genesis.clone(),
                clock.clone(),
            );
            booth.set_ballot_generator(generator_public.clone());
            let agent = if n < config.voting_computers {
                BallotAgent::Booth(booth)
            } else {
                BallotAgent::RogueBooth(AdversaryVotingComputer::new(booth))
            };
            booths.push(ballots.join(agent));
        }
        ballots.mesh(&booths);
        let generator_rng = StdRng::seed_from_u64(rng.gen());
        let generator = ballots.join(BallotAgent::Generator(BallotGenerator::new(
            generator_key,
            stock,
            clock.clone(),
            generator_rng,
        )));
        ballots.connect(&generator, &booths);
        ballots.follow(&generator, &booths);

        let mut voters = Network::new();
        let mut registrars = Vec::with_capacity(registrar_count);
        for n in 0..registrar_count {
            let registrar = VoterComputer::new(
                Keypair::generate(config.key_bits)?,
                voter_genesis.clone(),
                clock.clone(),
            );
            let agent = if n < config.voter_computers {
                VoterAgent::Registrar(registrar)
            } else {
                VoterAgent::RogueRegistrar(AdversaryVoterComputer::new(registrar))
            };
            registrars.push(voters.join(agent));
        }
        voters.mesh(&registrars);

        info!(
            "precinct for {} ready: {} voting computers, {} voter computers, {} ballots",
            definition.name,
            booths.len(),
            registrars.len(),
            definition.voter_roll.len()
        );
        Ok(Precinct {
            definition,
            ballots,
            voters,
            generator,
            booths,
            registrars,
            vote_genesis: Arc::new(vote_genesis),
            voter_genesis: Arc::new(voter_genesis),
            paper_trail: Vec::new(),
            rng,
            round: 0,
        })
    }

    /// Runs one voter through registration, ballot issue and marking.
    pub fn cast_vote(
        &mut self,
        voter_id: &str,
        selections: &[ChoiceKey],
    ) -> Result<Receipt, crate::Error> {
        let voter = self
            .definition
            .voter(voter_id)
            .cloned()
            .ok_or_else(|| ValidationError::NotRegistered(voter_id.to_string()))?;

        // Marks go on a specimen first so a bad selection never spoils a real ballot.
        let mut specimen = self.definition.specimen();
        for key in selections {
            specimen.select(key)?;
        }
        if !specimen.is_filled() {
            return Err(ValidationError::BallotNotFilled(specimen.id().to_string()).into());
        }

        let registrar = self.pick(Role::Registrar)?;
        let node = self
            .voters
            .node(&registrar)
            .ok_or_else(|| ValidationError::NotRegistered(voter_id.to_string()))?;
        if !node.authenticate_voter(&voter, &self.definition.voter_roll) {
            return Err(ValidationError::NotRegistered(voter_id.to_string()).into());
        }
        if node.has_voter_voted(&voter) {
            return Err(ValidationError::AlreadyVoted(voter_id.to_string()).into());
        }

        if !self.ballots_available() {
            return Err(ValidationError::NoBallotsAvailable.into());
        }
        self.run_voter(&registrar, voter)?;
        let mut ballot = self.retrieve_ballot()?;

        for key in selections {
            ballot.select(key)?;
        }
        self.paper_trail.push(ballot.clone());
        let booth = self.pick(Role::Booth)?;
        let ballot_id = ballot.id().to_string();
        self.run_ballot(&booth, ballot)?;

        info!("voter {} cast ballot {}", voter_id, ballot_id);
        Ok(Receipt {
            voter: voter_id.to_string(),
            ballot: ballot_id,
            voter_computer: registrar,
            voting_computer: booth,
        })
    }

    /// Broadcasts every outgoing batch, then has the first voting computer
    /// and the first voter computer seal a block each.
    pub fn close_round(&mut self) -> Result<RoundReport, crate::Error> {
        self.round += 1;
        let mut senders = vec![self.generator];
        senders.extend(self.booths.iter().copied());
        let (ballot_transactions, ballot_broadcast) = self.ballots.broadcast_from(&senders)?;
        let (voter_transactions, voter_broadcast) = self.voters.broadcast_from(&self.registrars)?;

        let vote_block = match self.booths.first() {
            Some(proposer) => seal(&mut self.ballots, proposer)?,
            None => (None, Delivery::default()),
        };
        let voter_block = match self.registrars.first() {
            Some(proposer) => seal(&mut self.voters, proposer)?,
            None => (None, Delivery::default()),
        };

        let report = RoundReport {
            round: self.round,
            ballot_transactions,
            voter_transactions,
            vote_block: vote_block.0,
            voter_block: voter_block.0,
            vote_delivery: total([ballot_broadcast, vote_block.1]),
            voter_delivery: total([voter_broadcast, voter_block.1]),
        };
        info!(
            "round {} closed: vote chain {}, voter chain {}",
            report.round,
            self.vote_chain_height(),
            self.voter_chain_height()
        );
        Ok(report)
    }

    pub fn definition(&self) -> &ElectionDefinition {
        &self.definition
    }

    pub fn generator(&self) -> Fingerprint {
        self.generator
    }

    pub fn voting_computers(&self) -> &[Fingerprint] {
        &self.booths
    }

    pub fn voter_computers(&self) -> &[Fingerprint] {
        &self.registrars
    }

    pub fn ballot_network(&self) -> &Network<BallotAgent> {
        &self.ballots
    }

    pub fn voter_network(&self) -> &Network<VoterAgent> {
        &self.voters
    }

    pub fn ballot_network_mut(&mut self) -> &mut Network<BallotAgent> {
        &mut self.ballots
    }

    pub fn voter_network_mut(&mut self) -> &mut Network<VoterAgent> {
        &mut self.voters
    }

    /// Marked ballots in casting order, independent of any ledger.
    pub fn paper_trail(&self) -> &[Ballot] {
        &self.paper_trail
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Committed snapshot at the first voting computer.
    pub fn vote_ledger(&self) -> Arc<VoteLedger> {
        self.vote_node()
            .map(|node| node.core().ledger().clone())
            .unwrap_or_else(|| self.vote_genesis.clone())
    }

    /// Committed snapshot at the first voter computer.
    pub fn voter_ledger(&self) -> Arc<VoterLedger> {
        self.voter_node()
            .map(|node| node.core().ledger().clone())
            .unwrap_or_else(|| self.voter_genesis.clone())
    }

    pub fn vote_chain_height(&self) -> usize {
        self.vote_node().map_or(0, |node| node.core().chain().height())
    }

    pub fn voter_chain_height(&self) -> usize {
        self.voter_node().map_or(0, |node| node.core().chain().height())
    }

    /// Committed tallies and ballot counts.
    pub fn results(&self) -> LedgerSummary {
        LedgerSummary::from(self.vote_ledger().as_ref())
    }

    pub fn turnout(&self) -> LedgerSummary {
        LedgerSummary::from(self.voter_ledger().as_ref())
    }

    pub fn ballot_state(&self, ballot_id: &str) -> Option<BallotState> {
        self.vote_ledger().state_of(ballot_id)
    }

    pub fn voter_state(&self, voter_id: &str) -> Option<VoterState> {
        self.voter_ledger().state_of(voter_id)
    }

    pub fn vote_chain(&self) -> Vec<BlockRecord> {
        self.vote_node().map_or_else(Vec::new, |node| node.core().chain().records())
    }

    pub fn voter_chain(&self) -> Vec<BlockRecord> {
        self.voter_node().map_or_else(Vec::new, |node| node.core().chain().records())
    }

    /// Collects every rejection and state conflict on every node and checks
    /// the two chains against each other.
    pub fn audit(&self) -> AuditReport {
        let mut rejected = Vec::new();
        let mut conflicts = Vec::new();
        let mut seen = BTreeSet::new();
        for node in self.ballots.nodes() {
            collect(node.core(), node.role(), &mut rejected, &mut conflicts, &mut seen);
        }
        for node in self.voters.nodes() {
            collect(node.core(), node.role(), &mut rejected, &mut conflicts, &mut seen);
        }

        let ballots_used = self.vote_ledger().count(BallotState::Used);
        let voters_voted = self.voter_ledger().count(VoterState::Voted);
        let replicas_agree =
            agree(&self.ballots, &self.booths) && agree(&self.voters, &self.registrars);
        let chains_valid = self.vote_node().map_or(true, |node| node.core().chain().audit().is_ok())
            && self.voter_node().map_or(true, |node| node.core().chain().audit().is_ok());
        let consistent = ballots_used == voters_voted && replicas_agree && chains_valid;
        if !consistent {
            warn!(
                "audit found a discrepancy: {} ballots used, {} voters voted",
                ballots_used, voters_voted
            );
        }
        AuditReport {
            rejected,
            conflicts,
            ballots_used,
            voters_voted,
            consistent,
            vote_chain_height: self.vote_chain_height(),
            voter_chain_height: self.voter_chain_height(),
        }
    }

    fn pick(&mut self, role: Role) -> Result<Fingerprint, ValidationError> {
        let candidates = match role {
            Role::Booth => &self.booths,
            Role::Registrar => &self.registrars,
        };
        candidates
            .choose(&mut self.rng)
            .copied()
            .ok_or_else(|| {
                ValidationError::InvalidDefinition(format!("no {:?} in this precinct", role))
            })
    }

    fn ballots_available(&self) -> bool {
        matches!(
            self.ballots.node(&self.generator),
            Some(BallotAgent::Generator(generator)) if generator.are_ballots_available()
        )
    }

    fn retrieve_ballot(&mut self) -> Result<Ballot, crate::Error> {
        let routed = self.ballots.with_node(&self.generator, |node, outbox| match node {
            BallotAgent::Generator(generator) => generator.retrieve_ballot(outbox),
            _ => Err(ValidationError::NoBallotsAvailable.into()),
        });
        match routed {
            Some((ballot, _)) => ballot,
            None => Err(ValidationError::NoBallotsAvailable.into()),
        }
    }

    fn run_voter(&mut self, registrar: &Fingerprint, voter: Voter) -> Result<(), crate::Error> {
        match self
            .voters
            .with_node(registrar, |node, outbox| node.create_transaction(voter, outbox))
        {
            Some((result, _)) => result,
            None => Err(ValidationError::NotRegistered(registrar.to_string()).into()),
        }
    }

    fn run_ballot(&mut self, booth: &Fingerprint, ballot: Ballot) -> Result<(), crate::Error> {
        let ballot_id = ballot.id().to_string();
        match self
            .ballots
            .with_node(booth, |node, outbox| node.create_transaction(ballot, outbox))
        {
            Some((result, _)) => result,
            None => Err(ValidationError::BallotNotIssued(ballot_id).into()),
        }
    }

    fn vote_node(&self) -> Option<&BallotAgent> {
        self.booths.first().and_then(|booth| self.ballots.node(booth))
    }

    fn voter_node(&self) -> Option<&VoterAgent> {
        self.registrars.first().and_then(|registrar| self.voters.node(registrar))
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Booth,
    Registrar,
}

fn collect<C: Content>(
    core: &crate::node::NodeCore<C>,
    role: &'static str,
    rejected: &mut Vec<RejectionEntry>,
    conflicts: &mut Vec<StateConflictError>,
    seen: &mut BTreeSet<(String, crate::crypto::Signature)>,
) {
    rejected.extend(core.rejected().iter().map(|entry| RejectionEntry {
        node: core.fingerprint(),
        role,
        transaction: entry.transaction.record(),
        reason: entry.reason.to_string(),
    }));
    for conflict in core.conflicts() {
        if seen.insert((conflict.conflict.to_string(), conflict.signature.clone())) {
            conflicts.push(conflict.clone());
        }
    }
}

fn seal<A: Agent>(
    network: &mut Network<A>,
    proposer: &Fingerprint,
) -> Result<(Option<BlockRecord>, Delivery), crate::Error> {
    match network.with_node(proposer, |node, outbox| node.seal(outbox)) {
        Some((sealed, delivery)) => Ok((sealed?.map(|block| block.record()), delivery)),
        None => Ok((None, Delivery::default())),
    }
}

/// All members report the same head.
fn agree<A: Agent>(network: &Network<A>, members: &[Fingerprint]) -> bool {
    let mut heads = members
        .iter()
        .filter_map(|member| network.node(member))
        .map(|node| node.core().chain().head_header().cloned());
    match heads.next() {
        Some(first) => heads.all(|head| head == first),
        None => true,
    }
}
