//! Current-state projection of accepted transactions and the replay algorithm
//! that derives a new snapshot from an unordered batch.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crypto::Signature;
use crate::election::{Ballot, ChoiceKey, Voter};
use crate::state::{BallotState, EntityState, VoterState};
use crate::transaction::{Content, SignatureOptions, Transaction};

/// Per-entity state plus aggregate counters. Snapshots are never mutated
/// after construction; [`Ledger::apply`] returns a fresh one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger<S: EntityState> {
    states: BTreeMap<String, S>,
    totals: BTreeMap<S, u64>,
    tallies: BTreeMap<ChoiceKey, u64>,
}

pub type VoteLedger = Ledger<BallotState>;
pub type VoterLedger = Ledger<VoterState>;

impl<S: EntityState> Ledger<S> {
    /// Every entity starts in the initial state. Duplicate ids collapse.
    pub fn new<I, T>(entities: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let states: BTreeMap<String, S> = entities
            .into_iter()
            .map(|id| (id.into(), S::initial()))
            .collect();
        let mut totals: BTreeMap<S, u64> = S::ALL.iter().map(|state| (*state, 0)).collect();
        totals.insert(S::initial(), states.len() as u64);
        Ledger {
            states,
            totals,
            tallies: BTreeMap::new(),
        }
    }

    /// Registers countable choices, each starting at zero.
    pub fn with_choices(mut self, choices: impl IntoIterator<Item = ChoiceKey>) -> Self {
        for choice in choices {
            self.tallies.entry(choice).or_insert(0);
        }
        self
    }

    pub fn state_of(&self, entity: &str) -> Option<S> {
        self.states.get(entity).copied()
    }

    pub fn tally_of(&self, choice: &ChoiceKey) -> Option<u64> {
        self.tallies.get(choice).copied()
    }

    pub fn aggregate_counts(&self) -> &BTreeMap<S, u64> {
        &self.totals
    }

    pub fn count(&self, state: S) -> u64 {
        self.totals.get(&state).copied().unwrap_or(0)
    }

    pub fn tallies(&self) -> &BTreeMap<ChoiceKey, u64> {
        &self.tallies
    }

    pub fn entities(&self) -> impl Iterator<Item = (&str, S)> {
        self.states.iter().map(|(id, state)| (id.as_str(), *state))
    }

    pub fn total_entities(&self) -> u64 {
        self.states.len() as u64
    }

    /// SHA-256 over the canonical listing of states, totals and tallies.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (id, state) in &self.states {
            hasher.update(format!("{}={};", id, state.as_str()));
        }
        for (state, count) in &self.totals {
            hasher.update(format!("#{}={};", state.as_str(), count));
        }
        for (choice, count) in &self.tallies {
            hasher.update(format!("@{}={};", choice, count));
        }
        format!("{:x}", hasher.finalize())
    }

    /// Replays `batch` against this snapshot.
    ///
    /// Runs at most [`EntityState::max_chain`] passes. In each pass a
    /// transaction is ready when its `previous_state` equals the entity's state
    /// at the start of the pass. Ready transactions for one entity that agree
    /// on target and signed content are applied once, the rest reported as
    /// duplicates. Ready transactions that disagree are all excluded as
    /// divergent. Whatever is left after the last pass is reported as
    /// unresolved. Copies of the same signed transaction count once.
    pub fn apply<C>(&self, batch: &[Transaction<C>]) -> Replay<S>
    where
        C: Content<State = S>,
    {
        let mut next = self.clone();
        let mut applied = Vec::new();
        let mut conflicts = Vec::new();

        let mut remaining: BTreeMap<&Signature, &Transaction<C>> = BTreeMap::new();
        for tx in batch {
            if next.states.contains_key(tx.entity_id()) {
                remaining.insert(tx.signature(), tx);
            } else {
                conflicts.push(StateConflictError::new(tx, ConflictKind::UnknownEntity));
            }
        }

        for _ in 0..S::max_chain() {
            let mut ready: BTreeMap<&str, Vec<&Signature>> = BTreeMap::new();
            for (&signature, &tx) in &remaining {
                if next.state_of(tx.entity_id()) == Some(tx.previous_state()) {
                    ready.entry(tx.entity_id()).or_default().push(signature);
                }
            }
            if ready.is_empty() {
                break;
            }

            for (entity, signatures) in ready {
                let ready_txs: Vec<&Transaction<C>> = signatures
                    .iter()
                    .filter_map(|signature| remaining.remove(*signature))
                    .collect();
                // Signature order, so the lowest signature wins among equals.
                let Some((&tx, others)) = ready_txs.split_first() else {
                    continue;
                };
                if others.iter().any(|other| !agrees(tx, other)) {
                    let rivals = ready_txs.len();
                    for rival in &ready_txs {
                        conflicts.push(StateConflictError::new(
                            *rival,
                            ConflictKind::Divergent {
                                state: rival.previous_state().as_str(),
                                rivals,
                            },
                        ));
                    }
                    continue;
                }

                let choices = if tx.new_state().is_terminal() {
                    tx.content().selected_choices()
                } else {
                    Vec::new()
                };
                let unknown = choices
                    .iter()
                    .find(|choice| !next.tallies.contains_key(*choice));
                if let Some(unknown) = unknown {
                    for excluded in &ready_txs {
                        conflicts.push(StateConflictError::new(
                            *excluded,
                            ConflictKind::UnknownChoice(unknown.clone()),
                        ));
                    }
                    continue;
                }

                next.transition(entity, tx.previous_state(), tx.new_state());
                for choice in &choices {
                    if let Some(tally) = next.tallies.get_mut(choice) {
                        *tally += 1;
                    }
                }
                applied.push(tx.signature().clone());
                for duplicate in others {
                    conflicts.push(StateConflictError::new(
                        *duplicate,
                        ConflictKind::Duplicate {
                            state: tx.new_state().as_str(),
                        },
                    ));
                }
            }
        }

        for tx in remaining.into_values() {
            let found = next.state_of(tx.entity_id()).unwrap_or_else(S::initial);
            let kind = if tx.previous_state() > found {
                ConflictKind::Premature {
                    expected: tx.previous_state().as_str(),
                    found: found.as_str(),
                }
            } else {
                ConflictKind::Stale {
                    expected: tx.previous_state().as_str(),
                    found: found.as_str(),
                }
            };
            conflicts.push(StateConflictError::new(tx, kind));
        }

        Replay {
            ledger: next,
            applied,
            conflicts,
        }
    }

    fn transition(&mut self, entity: &str, from: S, to: S) {
        if let Some(state) = self.states.get_mut(entity) {
            *state = to;
        }
        if let Some(count) = self.totals.get_mut(&from) {
            *count = count.saturating_sub(1);
        }
        *self.totals.entry(to).or_insert(0) += 1;
    }
}

/// Same edge and same signed content, whoever signed it.
fn agrees<C: Content>(tx: &Transaction<C>, other: &Transaction<C>) -> bool {
    let options = SignatureOptions::default();
    tx.new_state() == other.new_state()
        && tx.content().signature_contents(options) == other.content().signature_contents(options)
}

impl VoteLedger {
    /// All ballots `Created`, every choice on them at zero.
    pub fn from_ballots(ballots: &[Ballot]) -> Self {
        Ledger::new(ballots.iter().map(|ballot| ballot.id().to_string()))
            .with_choices(ballots.iter().flat_map(|ballot| ballot.choice_keys()))
    }
}

impl VoterLedger {
    pub fn from_roll(voters: &[Voter]) -> Self {
        Ledger::new(voters.iter().map(|voter| voter.id.clone()))
    }
}

/// Output of one replay.
#[derive(Debug, Clone)]
pub struct Replay<S: EntityState> {
    pub ledger: Ledger<S>,
    /// Signatures of applied transactions, in application order.
    pub applied: Vec<Signature>,
    pub conflicts: Vec<StateConflictError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictKind {
    /// The entity has not reached the precondition yet; a later batch may.
    Premature { expected: &'static str, found: &'static str },
    /// The entity has moved past the precondition for good.
    Stale { expected: &'static str, found: &'static str },
    /// Several transactions left the same state for different outcomes in one pass.
    Divergent { state: &'static str, rivals: usize },
    /// Another transaction with the same outcome was applied in its place.
    Duplicate { state: &'static str },
    UnknownEntity,
    UnknownChoice(ChoiceKey),
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Premature { expected, found } => {
                write!(f, "expects `{}` but entity is still `{}`", expected, found)
            }
            ConflictKind::Stale { expected, found } => {
                write!(f, "expects `{}` but entity is already `{}`", expected, found)
            }
            ConflictKind::Divergent { state, rivals } => {
                write!(f, "{} transactions compete to leave `{}`", rivals, state)
            }
            ConflictKind::Duplicate { state } => {
                write!(f, "duplicates a transaction that already moved the entity to `{}`", state)
            }
            ConflictKind::UnknownEntity => f.write_str("entity is not on this ledger"),
            ConflictKind::UnknownChoice(choice) => {
                write!(f, "choice {} is not on this ledger", choice)
            }
        }
    }
}

/// A transaction the replay could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("state conflict on {kind_name} {entity}: {conflict}")]
pub struct StateConflictError {
    pub kind_name: &'static str,
    pub entity: String,
    pub signature: Signature,
    pub conflict: ConflictKind,
}

impl StateConflictError {
    fn new<C: Content>(tx: &Transaction<C>, conflict: ConflictKind) -> Self {
        StateConflictError {
            kind_name: C::KIND,
            entity: tx.entity_id().to_string(),
            signature: tx.signature().clone(),
            conflict,
        }
    }

    /// Whether the transaction may still apply against a later snapshot.
    pub fn is_retryable(&self) -> bool {
        matches!(self.conflict, ConflictKind::Premature { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::keypair;
    use crate::crypto::Keypair;
    use crate::election::tests::items;

    fn ballot_tx(
        node: &Keypair,
        ballot: &Ballot,
        from: BallotState,
        to: BallotState,
    ) -> Transaction<Ballot> {
        Transaction::new(ballot.clone(), node, from, to, None, SignatureOptions::default()).unwrap()
    }

    fn marked(id: &str, president: &str) -> Ballot {
        let mut ballot = Ballot::new(id, "E", items());
        ballot.select(&ChoiceKey::new("President", president)).unwrap();
        ballot.select(&ChoiceKey::new("Vice President", "V1")).unwrap();
        ballot
    }

    fn assert_counter_invariant<S: EntityState>(ledger: &Ledger<S>) {
        let sum: u64 = ledger.aggregate_counts().values().sum();
        assert_eq!(sum, ledger.total_entities());
    }

    fn two_ballots() -> (Ballot, Ballot, VoteLedger) {
        let b1 = Ballot::new("b1", "E", items());
        let b2 = Ballot::new("b2", "E", items());
        let ledger = VoteLedger::from_ballots(&[b1.clone(), b2.clone()]);
        (b1, b2, ledger)
    }

    #[test]
    fn test_initial_counters() {
        let (_, _, ledger) = two_ballots();
        assert_eq!(ledger.count(BallotState::Created), 2);
        assert_eq!(ledger.count(BallotState::Issued), 0);
        assert_eq!(ledger.count(BallotState::Used), 0);
        assert_eq!(ledger.tally_of(&ChoiceKey::new("President", "X")), Some(0));
        assert_counter_invariant(&ledger);
    }

    #[test]
    fn test_two_ballot_scenario() {
        let node = keypair();
        let (b1, _, ledger) = two_ballots();

        let issue = ballot_tx(&node, &b1, BallotState::Created, BallotState::Issued);
        let first = ledger.apply(&[issue.clone()]);
        assert!(first.conflicts.is_empty());
        let ledger = first.ledger;
        assert_eq!(ledger.count(BallotState::Created), 1);
        assert_eq!(ledger.count(BallotState::Issued), 1);
        assert_eq!(ledger.count(BallotState::Used), 0);
        assert_counter_invariant(&ledger);

        let used = ballot_tx(&node, &marked("b1", "X"), BallotState::Issued, BallotState::Used);
        let ledger = ledger.apply(&[used]).ledger;
        assert_eq!(ledger.count(BallotState::Created), 1);
        assert_eq!(ledger.count(BallotState::Issued), 0);
        assert_eq!(ledger.count(BallotState::Used), 1);
        assert_eq!(ledger.tally_of(&ChoiceKey::new("President", "X")), Some(1));
        assert_eq!(ledger.tally_of(&ChoiceKey::new("President", "Y")), Some(0));
        assert_eq!(ledger.state_of("b1"), Some(BallotState::Used));
        assert_counter_invariant(&ledger);

        let again = ledger.apply(&[issue]);
        assert_eq!(again.ledger, ledger);
        assert!(again.applied.is_empty());
        assert!(matches!(again.conflicts[0].conflict, ConflictKind::Stale { .. }));
        assert!(!again.conflicts[0].is_retryable());
    }

    #[test]
    fn test_order_insensitive() {
        let node = keypair();
        let (b1, _, ledger) = two_ballots();
        let issue = ballot_tx(&node, &b1, BallotState::Created, BallotState::Issued);
        let used = ballot_tx(&node, &marked("b1", "Y"), BallotState::Issued, BallotState::Used);

        let forward = ledger.apply(&[issue.clone(), used.clone()]);
        let backward = ledger.apply(&[used, issue]);
        assert_eq!(forward.ledger, backward.ledger);
        assert_eq!(forward.ledger.content_hash(), backward.ledger.content_hash());
        assert_eq!(forward.ledger.state_of("b1"), Some(BallotState::Used));
        assert_eq!(forward.ledger.tally_of(&ChoiceKey::new("President", "Y")), Some(1));
        assert!(forward.conflicts.is_empty() && backward.conflicts.is_empty());
    }

    #[test]
    fn test_duplicate_in_batch_counts_once() {
        let node = keypair();
        let (b1, _, ledger) = two_ballots();
        let issue = ballot_tx(&node, &b1, BallotState::Created, BallotState::Issued);
        let used = ballot_tx(&node, &marked("b1", "X"), BallotState::Issued, BallotState::Used);

        let once = ledger.apply(&[issue.clone(), used.clone()]);
        let twice = ledger.apply(&[issue, used.clone(), used]);
        assert_eq!(once.ledger, twice.ledger);
        assert_eq!(twice.ledger.tally_of(&ChoiceKey::new("President", "X")), Some(1));
    }

    #[test]
    fn test_divergent_transactions_both_excluded() {
        let node = keypair();
        let (b1, _, ledger) = two_ballots();
        let ledger = ledger
            .apply(&[ballot_tx(&node, &b1, BallotState::Created, BallotState::Issued)])
            .ledger;

        let for_x = ballot_tx(&node, &marked("b1", "X"), BallotState::Issued, BallotState::Used);
        let for_y = ballot_tx(&node, &marked("b1", "Y"), BallotState::Issued, BallotState::Used);
        let replay = ledger.apply(&[for_x, for_y]);

        assert_eq!(replay.ledger, ledger);
        assert_eq!(replay.conflicts.len(), 2);
        assert!(replay
            .conflicts
            .iter()
            .all(|c| c.conflict == ConflictKind::Divergent { state: "ballot_issued", rivals: 2 }));
    }

    #[test]
    fn test_agreeing_transactions_apply_once() {
        let (b1, _, ledger) = two_ballots();
        let ledger = ledger
            .apply(&[ballot_tx(&keypair(), &b1, BallotState::Created, BallotState::Issued)])
            .ledger;

        let marks = marked("b1", "X");
        let first = ballot_tx(&keypair(), &marks, BallotState::Issued, BallotState::Used);
        let second = ballot_tx(&keypair(), &marks, BallotState::Issued, BallotState::Used);
        let winner = std::cmp::min(first.signature(), second.signature()).clone();
        let replay = ledger.apply(&[first.clone(), second.clone()]);

        assert_eq!(replay.applied, vec![winner.clone()]);
        assert_eq!(replay.ledger.state_of("b1"), Some(BallotState::Used));
        assert_eq!(replay.ledger.tally_of(&ChoiceKey::new("President", "X")), Some(1));
        assert_counter_invariant(&replay.ledger);
        assert_eq!(replay.conflicts.len(), 1);
        assert_ne!(replay.conflicts[0].signature, winner);
        assert_eq!(replay.conflicts[0].conflict, ConflictKind::Duplicate { state: "ballot_used" });
        assert!(!replay.conflicts[0].is_retryable());

        // Evaluation order does not pick the winner.
        assert_eq!(ledger.apply(&[second, first]).applied, vec![winner]);
    }

    #[test]
    fn test_premature_transaction_is_retryable() {
        let node = keypair();
        let (_, _, ledger) = two_ballots();
        let used = ballot_tx(&node, &marked("b2", "X"), BallotState::Issued, BallotState::Used);
        let replay = ledger.apply(&[used]);
        assert_eq!(replay.ledger, ledger);
        assert_eq!(
            replay.conflicts[0].conflict,
            ConflictKind::Premature {
                expected: "ballot_issued",
                found: "ballot_created"
            }
        );
        assert!(replay.conflicts[0].is_retryable());
    }

    #[test]
    fn test_unknown_entity_and_choice() {
        let node = keypair();
        let (b1, _, ledger) = two_ballots();
        let stranger = Ballot::new("b9", "E", items());
        let replay =
            ledger.apply(&[ballot_tx(&node, &stranger, BallotState::Created, BallotState::Issued)]);
        assert_eq!(replay.conflicts[0].conflict, ConflictKind::UnknownEntity);

        let ledger = ledger
            .apply(&[ballot_tx(&node, &b1, BallotState::Created, BallotState::Issued)])
            .ledger;
        let mut items = items();
        items[0].choices.push(crate::election::Choice::new("Write-in"));
        let mut odd = Ballot::new("b1", "E", items);
        odd.select(&ChoiceKey::new("President", "Write-in")).unwrap();
        let replay =
            ledger.apply(&[ballot_tx(&node, &odd, BallotState::Issued, BallotState::Used)]);
        assert_eq!(replay.ledger, ledger);
        assert_eq!(
            replay.conflicts[0].conflict,
            ConflictKind::UnknownChoice(ChoiceKey::new("President", "Write-in"))
        );
    }

    #[test]
    fn test_voter_ledger_single_pass() {
        let node = keypair();
        let roll = vec![Voter::new("Ada", "1"), Voter::new("Grace", "2")];
        let ledger = VoterLedger::from_roll(&roll);
        let vote = Transaction::new(
            roll[0].clone(),
            &node,
            VoterState::NotVoted,
            VoterState::Voted,
            None,
            SignatureOptions::default(),
        )
        .unwrap();
        let replay = ledger.apply(&[vote.clone()]);
        assert_eq!(replay.ledger.count(VoterState::Voted), 1);
        assert_eq!(replay.ledger.count(VoterState::NotVoted), 1);
        assert_counter_invariant(&replay.ledger);

        let twice = replay.ledger.apply(&[vote]);
        assert_eq!(twice.ledger, replay.ledger);
        assert_eq!(twice.conflicts.len(), 1);
    }

    #[test]
    fn test_content_hash_tracks_state() {
        let node = keypair();
        let (b1, _, ledger) = two_ballots();
        let next = ledger
            .apply(&[ballot_tx(&node, &b1, BallotState::Created, BallotState::Issued)])
            .ledger;
        assert_ne!(ledger.content_hash(), next.content_hash());
        assert_eq!(ledger.content_hash(), ledger.clone().content_hash());
    }
}
