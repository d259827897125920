//! Append-only block sequence with a single extension point.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::block::Block;
use crate::crypto::{Keypair, Signature};
use crate::error::{ChainIntegrityError, SignatureError};
use crate::ledger::{Ledger, StateConflictError};
use crate::models::BlockRecord;
use crate::transaction::{Content, Transaction};

/// Label used for the missing predecessor of the first block.
pub const GENESIS: &str = "genesis";

/// A block built against the head the chain had at proposal time.
#[derive(Debug, Clone)]
pub struct Proposal<C: Content> {
    pub block: Arc<Block<C>>,
    /// Transactions from the batch left out of the block.
    pub conflicts: Vec<StateConflictError>,
}

#[derive(Debug, Clone)]
pub struct Blockchain<C: Content> {
    genesis: Arc<Ledger<C::State>>,
    blocks: Vec<Arc<Block<C>>>,
}

impl<C: Content> Blockchain<C> {
    pub fn new(initial: Ledger<C::State>) -> Self {
        Blockchain {
            genesis: Arc::new(initial),
            blocks: Vec::new(),
        }
    }

    pub fn head(&self) -> Option<&Arc<Block<C>>> {
        self.blocks.last()
    }

    pub fn head_header(&self) -> Option<&Signature> {
        self.head().map(|block| block.header())
    }

    pub fn height(&self) -> usize {
        self.blocks.len()
    }

    pub fn genesis_ledger(&self) -> &Arc<Ledger<C::State>> {
        &self.genesis
    }

    /// Snapshot of the head, or the initial ledger for an empty chain.
    pub fn current_ledger(&self) -> &Arc<Ledger<C::State>> {
        self.head().map(|block| block.ledger()).unwrap_or(&self.genesis)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Arc<Block<C>>> {
        self.blocks.iter()
    }

    /// Replays `batch` on the current ledger and signs a block over the
    /// applied transactions, the new snapshot and the current head.
    pub fn propose_block(
        &self,
        batch: &[Transaction<C>],
        proposer: &Keypair,
        timestamp: DateTime<Utc>,
    ) -> Result<Proposal<C>, crate::Error> {
        let replay = self.current_ledger().apply(batch);
        let mut by_signature: BTreeMap<&Signature, &Transaction<C>> =
            batch.iter().map(|tx| (tx.signature(), tx)).collect();
        let transactions = replay
            .applied
            .iter()
            .filter_map(|signature| by_signature.remove(signature).cloned())
            .collect();
        let block = Block::new(
            transactions,
            Arc::new(replay.ledger),
            self.head_header().cloned(),
            timestamp,
            proposer,
        )?;
        Ok(Proposal {
            block: Arc::new(block),
            conflicts: replay.conflicts,
        })
    }

    /// Whether `block` links to the current head.
    pub fn extends(&self, block: &Block<C>) -> Result<(), ChainIntegrityError> {
        if block.previous_header() != self.head_header() {
            return Err(ChainIntegrityError {
                expected: label(self.head_header()),
                found: label(block.previous_header()),
            });
        }
        Ok(())
    }

    /// Extends the chain iff `block` links to the current head.
    pub fn append(&mut self, block: Arc<Block<C>>) -> Result<(), ChainIntegrityError> {
        self.extends(&block)?;
        info!(
            "{} chain extended to height {} by {} ({} transactions)",
            C::KIND,
            self.blocks.len() + 1,
            block.header().short(),
            block.transactions().len()
        );
        self.blocks.push(block);
        Ok(())
    }

    /// Re-checks every link and header signature from the first block on.
    pub fn audit(&self) -> Result<(), crate::Error> {
        let mut previous: Option<&Signature> = None;
        for block in &self.blocks {
            if block.previous_header() != previous {
                return Err(ChainIntegrityError {
                    expected: label(previous),
                    found: label(block.previous_header()),
                }
                .into());
            }
            if !block.verify() {
                return Err(SignatureError::new(format!("block {}", block.header().short())).into());
            }
            previous = Some(block.header());
        }
        Ok(())
    }

    pub fn records(&self) -> Vec<BlockRecord> {
        self.blocks.iter().map(|block| block.record()).collect()
    }
}

pub(crate) fn label(header: Option<&Signature>) -> String {
    header.map(Signature::short).unwrap_or_else(|| GENESIS.to_string())
}
