//! Nodes: identity, trust mapping, transaction buckets and the local chain
//! replica, plus the role variants built on top of them.
//!
//! Nodes never share state. Everything a node tells another node goes
//! through an [`Outbox`] and is delivered by a [`crate::network::Network`].

mod booth;
mod issuer;
mod registrar;
mod roles;

pub use booth::{AdversaryVotingComputer, VotingComputer};
pub use issuer::BallotGenerator;
pub use registrar::{AdversaryVoterComputer, VoterAuthority, VoterComputer};
pub use roles::{BallotAgent, VoterAgent};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::block::Block;
use crate::chain::{Blockchain, Proposal};
use crate::clock::Clock;
use crate::crypto::{Fingerprint, Keypair, PublicKey, Signature};
use crate::election::Ballot;
use crate::error::{AdmissionError, SignatureError, ValidationError};
use crate::ledger::{Ledger, StateConflictError};
use crate::transaction::{timestamp_and_sign, Content, Transaction};

#[derive(Debug, Clone)]
pub enum Message<C: Content> {
    Transaction(Transaction<C>),
    Block(Arc<Block<C>>),
}

#[derive(Debug, Clone)]
pub struct Envelope<C: Content> {
    pub from: Fingerprint,
    pub to: Fingerprint,
    pub message: Message<C>,
}

pub type Outbox<C> = Vec<Envelope<C>>;

/// Where an admitted transaction landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// Untimestamped; waits for its second signature.
    Pending,
    /// Eligible for the next block.
    Verified,
}

/// A transaction that failed admission, kept for audit and never replayed.
#[derive(Debug, Clone)]
pub struct Rejected<C: Content> {
    pub transaction: Transaction<C>,
    pub reason: AdmissionError,
}

/// State every node role owns exclusively.
pub struct NodeCore<C: Content> {
    keypair: Keypair,
    peers: BTreeMap<Fingerprint, PublicKey>,
    /// Receive this node's blocks without being trusted by it.
    followers: BTreeSet<Fingerprint>,
    pending: BTreeMap<Signature, Transaction<C>>,
    verified: BTreeMap<Signature, Transaction<C>>,
    rejected: Vec<Rejected<C>>,
    conflicts: Vec<StateConflictError>,
    chain: Blockchain<C>,
    clock: Arc<dyn Clock>,
}

impl<C: Content> NodeCore<C> {
    pub fn new(keypair: Keypair, genesis: Ledger<C::State>, clock: Arc<dyn Clock>) -> Self {
        NodeCore {
            keypair,
            peers: BTreeMap::new(),
            followers: BTreeSet::new(),
            pending: BTreeMap::new(),
            verified: BTreeMap::new(),
            rejected: Vec::new(),
            conflicts: Vec::new(),
            chain: Blockchain::new(genesis),
            clock,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keypair.fingerprint()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Replaces the trust mapping. The node's own key is never part of it.
    pub fn set_peers(&mut self, peers: impl IntoIterator<Item = PublicKey>) {
        let own = self.fingerprint();
        self.peers = peers
            .into_iter()
            .filter(|key| key.fingerprint() != own)
            .map(|key| (key.fingerprint(), key))
            .collect();
    }

    pub fn add_follower(&mut self, follower: Fingerprint) {
        if follower != self.fingerprint() {
            self.followers.insert(follower);
        }
    }

    pub fn followers(&self) -> impl Iterator<Item = &Fingerprint> {
        self.followers.iter()
    }

    pub fn is_peer(&self, key: &PublicKey) -> bool {
        self.peers.get(&key.fingerprint()).map_or(false, |peer| peer == key)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PublicKey> {
        self.peers.values()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Transaction<C>> {
        self.pending.values()
    }

    pub fn verified(&self) -> impl Iterator<Item = &Transaction<C>> {
        self.verified.values()
    }

    pub fn rejected(&self) -> &[Rejected<C>] {
        &self.rejected
    }

    pub fn conflicts(&self) -> &[StateConflictError] {
        &self.conflicts
    }

    pub fn chain(&self) -> &Blockchain<C> {
        &self.chain
    }

    pub fn ledger(&self) -> &Arc<Ledger<C::State>> {
        self.chain.current_ledger()
    }

    /// Signature first, then trust. Failures land in `rejected`. Only
    /// untimestamped two-phase transactions wait in `pending`.
    pub fn admit(&mut self, tx: Transaction<C>, trusted: bool) -> Result<Bucket, AdmissionError> {
        let outcome = tx.check().map_err(AdmissionError::from).and_then(|()| {
            if trusted {
                Ok(())
            } else {
                Err(ValidationError::UntrustedIssuer(tx.issuer().fingerprint()).into())
            }
        });
        if let Err(reason) = outcome {
            warn!(
                "{} rejected {} transaction for {}: {}",
                self.fingerprint(),
                C::KIND,
                tx.entity_id(),
                reason
            );
            self.rejected.push(Rejected {
                transaction: tx,
                reason: reason.clone(),
            });
            return Err(reason);
        }

        if tx.is_timestamped() || !C::TWO_PHASE {
            self.pending
                .retain(|_, held| held.is_timestamped() || !held.is_copy_of(&tx));
            debug!("{} verified {} {}", self.fingerprint(), C::KIND, tx.entity_id());
            self.verified.insert(tx.signature().clone(), tx);
            Ok(Bucket::Verified)
        } else {
            debug!("{} holds pending {} {}", self.fingerprint(), C::KIND, tx.entity_id());
            self.pending.insert(tx.signature().clone(), tx);
            Ok(Bucket::Pending)
        }
    }

    /// Queues `message` for every peer in the trust mapping.
    pub fn fan_out(&self, message: Message<C>, outbox: &mut Outbox<C>) {
        let from = self.fingerprint();
        outbox.extend(self.peers.keys().map(|to| Envelope {
            from,
            to: *to,
            message: message.clone(),
        }));
    }

    /// Queues `block` for every peer and every follower.
    fn publish(&self, block: &Arc<Block<C>>, outbox: &mut Outbox<C>) {
        self.fan_out(Message::Block(block.clone()), outbox);
        let from = self.fingerprint();
        outbox.extend(
            self.followers
                .iter()
                .filter(|follower| !self.peers.contains_key(*follower))
                .map(|to| Envelope {
                    from,
                    to: *to,
                    message: Message::Block(block.clone()),
                }),
        );
    }

    /// Removes and returns the pending transactions this node issued.
    pub(crate) fn take_own_pending(&mut self) -> Vec<Transaction<C>> {
        let own = self.public_key().clone();
        let (mine, others): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, tx)| tx.issuer() == &own);
        self.pending = others;
        mine.into_values().collect()
    }

    pub fn propose(&self) -> Result<Proposal<C>, crate::Error> {
        let batch: Vec<Transaction<C>> = self.verified.values().cloned().collect();
        self.chain.propose_block(&batch, &self.keypair, self.now())
    }

    /// Proposes a block over the verified bucket, appends it locally and
    /// sends it to every peer and follower. Returns `None` when nothing could
    /// be applied.
    pub fn seal(
        &mut self,
        outbox: &mut Outbox<C>,
    ) -> Result<Option<Arc<Block<C>>>, crate::Error> {
        if self.verified.is_empty() {
            return Ok(None);
        }
        let proposal = self.propose()?;
        self.settle(proposal.conflicts);
        let block = proposal.block;
        if block.transactions().is_empty() {
            return Ok(None);
        }
        self.chain.append(block.clone())?;
        self.commit(&block);
        info!(
            "{} sealed {} block {} with {} transactions",
            self.fingerprint(),
            C::KIND,
            block.header().short(),
            block.transactions().len()
        );
        self.publish(&block, outbox);
        Ok(Some(block))
    }

    /// Validates a peer's block against the local replica and appends it.
    pub fn accept_block(
        &mut self,
        block: Arc<Block<C>>,
        trusted: bool,
    ) -> Result<(), crate::Error> {
        if !trusted {
            return Err(ValidationError::UntrustedIssuer(block.proposer().fingerprint()).into());
        }
        if !block.verify() {
            return Err(SignatureError::new(format!("block {}", block.header().short())).into());
        }
        if let Some(tx) = block.transactions().iter().find(|tx| !tx.verify()) {
            return Err(SignatureError::new(format!(
                "{} {} in block {}",
                C::KIND,
                tx.entity_id(),
                block.header().short()
            ))
            .into());
        }
        self.chain.extends(&block)?;
        let replay = self.chain.current_ledger().apply(block.transactions());
        if !replay.conflicts.is_empty() || replay.ledger.content_hash() != block.ledger_hash() {
            return Err(ValidationError::LedgerMismatch.into());
        }
        self.chain.append(block.clone())?;
        self.commit(&block);
        Ok(())
    }

    fn commit(&mut self, block: &Block<C>) {
        for tx in block.transactions() {
            self.verified.remove(tx.signature());
            self.pending.retain(|_, held| !held.is_copy_of(tx));
        }
    }

    /// Records replay conflicts. Permanent ones leave the verified bucket.
    fn settle(&mut self, conflicts: Vec<StateConflictError>) {
        for conflict in conflicts {
            if conflict.is_retryable() {
                debug!("{} deferring {}", self.fingerprint(), conflict);
            } else {
                warn!("{} excluding {}", self.fingerprint(), conflict);
                self.verified.remove(&conflict.signature);
            }
            if !self.conflicts.contains(&conflict) {
                self.conflicts.push(conflict);
            }
        }
    }
}

impl NodeCore<Ballot> {
    /// Second signing phase for this node's own pending ballot transactions:
    /// one shared timestamp, a fresh signature each, then self-admission and
    /// fan-out. Returns the batch size.
    pub fn release_batch(&mut self, outbox: &mut Outbox<Ballot>) -> Result<usize, crate::Error> {
        let mut batch = self.take_own_pending();
        if batch.is_empty() {
            return Ok(0);
        }
        let at = self.now();
        timestamp_and_sign(batch.iter_mut(), at, &self.keypair)?;
        let count = batch.len();
        for tx in batch {
            self.admit(tx.clone(), true)?;
            self.fan_out(Message::Transaction(tx), outbox);
        }
        info!("{} released a batch of {} ballot transactions", self.fingerprint(), count);
        Ok(count)
    }
}

/// The capability set shared by every role.
pub trait Agent: Send {
    type Content: Content;

    fn core(&self) -> &NodeCore<Self::Content>;

    fn core_mut(&mut self) -> &mut NodeCore<Self::Content>;

    fn fingerprint(&self) -> Fingerprint {
        self.core().fingerprint()
    }

    fn is_trusted(&self, key: &PublicKey) -> bool {
        self.core().is_peer(key)
    }

    fn admit(&mut self, tx: Transaction<Self::Content>) -> Result<Bucket, AdmissionError> {
        let trusted = self.is_trusted(tx.issuer());
        self.core_mut().admit(tx, trusted)
    }

    /// Builds, signs and locally admits the role's transaction for `content`.
    fn create_transaction(
        &mut self,
        content: Self::Content,
        outbox: &mut Outbox<Self::Content>,
    ) -> Result<(), crate::Error>;

    /// Sends the role's outgoing batch to every peer. Returns the batch size.
    fn broadcast(&mut self, outbox: &mut Outbox<Self::Content>) -> Result<usize, crate::Error>;

    fn seal(
        &mut self,
        outbox: &mut Outbox<Self::Content>,
    ) -> Result<Option<Arc<Block<Self::Content>>>, crate::Error> {
        self.core_mut().seal(outbox)
    }

    fn receive(&mut self, message: Message<Self::Content>) -> Result<(), crate::Error> {
        match message {
            Message::Transaction(tx) => {
                self.admit(tx)?;
                Ok(())
            }
            Message::Block(block) => {
                // Our own transactions come back inside peers' blocks.
                let own = self.core().public_key();
                let trusted = self.is_trusted(block.proposer())
                    && block
                        .transactions()
                        .iter()
                        .all(|tx| tx.issuer() == own || self.is_trusted(tx.issuer()));
                self.core_mut().accept_block(block, trusted)
            }
        }
    }
}
