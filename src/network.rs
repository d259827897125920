//! In-process message routing between nodes of one kind.
//!
//! Messages are delivered in FIFO order. A node handling a message may
//! queue further messages; `deliver` drains until the queue is empty.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};
use serde::Serialize;

use crate::crypto::{Fingerprint, PublicKey};
use crate::node::{Agent, Envelope, Outbox};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub delivered: usize,
    /// Handled by the recipient but refused (bad signature, untrusted, stale).
    pub refused: usize,
    /// Addressed to a fingerprint not on this network.
    pub undeliverable: usize,
}

impl Delivery {
    fn merge(&mut self, other: Delivery) {
        self.delivered += other.delivered;
        self.refused += other.refused;
        self.undeliverable += other.undeliverable;
    }
}

pub struct Network<A: Agent> {
    nodes: BTreeMap<Fingerprint, A>,
    queue: VecDeque<Envelope<A::Content>>,
}

impl<A: Agent> Default for Network<A> {
    fn default() -> Self {
        Network {
            nodes: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }
}

impl<A: Agent> Network<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, node: A) -> Fingerprint {
        let fingerprint = node.fingerprint();
        self.nodes.insert(fingerprint, node);
        fingerprint
    }

    pub fn node(&self, fingerprint: &Fingerprint) -> Option<&A> {
        self.nodes.get(fingerprint)
    }

    pub fn node_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut A> {
        self.nodes.get_mut(fingerprint)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &A> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn public_key(&self, fingerprint: &Fingerprint) -> Option<PublicKey> {
        self.nodes.get(fingerprint).map(|node| node.core().public_key().clone())
    }

    /// Makes every member trust every other member.
    pub fn mesh(&mut self, members: &[Fingerprint]) {
        for member in members {
            self.connect(member, members);
        }
    }

    /// Replaces the trust mapping of `member` with `peers`.
    pub fn connect(&mut self, member: &Fingerprint, peers: &[Fingerprint]) {
        let keys: Vec<PublicKey> = peers.iter().filter_map(|peer| self.public_key(peer)).collect();
        if let Some(node) = self.nodes.get_mut(member) {
            node.core_mut().set_peers(keys);
        }
    }

    /// Has every one of `leaders` send its blocks to `follower`.
    pub fn follow(&mut self, follower: &Fingerprint, leaders: &[Fingerprint]) {
        for leader in leaders {
            if let Some(node) = self.nodes.get_mut(leader) {
                node.core_mut().add_follower(*follower);
            }
        }
    }

    pub fn post(&mut self, outbox: Outbox<A::Content>) {
        self.queue.extend(outbox);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Drains the queue, including whatever delivery itself produces.
    pub fn deliver(&mut self) -> Delivery {
        let mut report = Delivery::default();
        while let Some(envelope) = self.queue.pop_front() {
            let Some(node) = self.nodes.get_mut(&envelope.to) else {
                warn!(
                    "no node {} on this network; dropping message from {}",
                    envelope.to, envelope.from
                );
                report.undeliverable += 1;
                continue;
            };
            match node.receive(envelope.message) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!("{} refused message from {}: {}", envelope.to, envelope.from, err);
                    report.refused += 1;
                }
            }
        }
        debug!("delivery finished: {:?}", report);
        report
    }

    /// Runs `action` on one node, then routes what it sent.
    pub fn with_node<R>(
        &mut self,
        fingerprint: &Fingerprint,
        action: impl FnOnce(&mut A, &mut Outbox<A::Content>) -> R,
    ) -> Option<(R, Delivery)> {
        let node = self.nodes.get_mut(fingerprint)?;
        let mut outbox = Vec::new();
        let result = action(node, &mut outbox);
        self.post(outbox);
        Some((result, self.deliver()))
    }

    /// Broadcasts from each of `senders` in order, then delivers once.
    pub fn broadcast_from(
        &mut self,
        senders: &[Fingerprint],
    ) -> Result<(usize, Delivery), crate::Error> {
        let mut outbox = Vec::new();
        let mut sent = 0;
        for sender in senders {
            if let Some(node) = self.nodes.get_mut(sender) {
                sent += node.broadcast(&mut outbox)?;
            }
        }
        self.post(outbox);
        Ok((sent, self.deliver()))
    }
}

/// Sums delivery reports.
pub fn total(reports: impl IntoIterator<Item = Delivery>) -> Delivery {
    let mut sum = Delivery::default();
    for report in reports {
        sum.merge(report);
    }
    sum
}
