use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::format_time;
use crate::crypto::{Keypair, PublicKey, Signature};
use crate::ledger::Ledger;
use crate::models::BlockRecord;
use crate::transaction::{Content, Transaction};

/// A transaction batch, the snapshot it produced and the link to its
/// predecessor. The header is the proposer's signature over all three and
/// doubles as the block's identity.
#[derive(Debug, Clone)]
pub struct Block<C: Content> {
    transactions: Vec<Transaction<C>>,
    ledger: Arc<Ledger<C::State>>,
    ledger_hash: String,
    previous_header: Option<Signature>,
    timestamp: DateTime<Utc>,
    proposer: PublicKey,
    header: Signature,
}

impl<C: Content> Block<C> {
    pub fn new(
        transactions: Vec<Transaction<C>>,
        ledger: Arc<Ledger<C::State>>,
        previous_header: Option<Signature>,
        timestamp: DateTime<Utc>,
        proposer: &Keypair,
    ) -> Result<Self, crate::Error> {
        let ledger_hash = ledger.content_hash();
        let contents = header_contents(
            previous_header.as_ref(),
            &transactions,
            &ledger_hash,
            &timestamp,
        );
        let header = proposer.sign(contents.as_bytes())?;
        Ok(Block {
            transactions,
            ledger,
            ledger_hash,
            previous_header,
            timestamp,
            proposer: proposer.public_key().clone(),
            header,
        })
    }

    pub fn transactions(&self) -> &[Transaction<C>] {
        &self.transactions
    }

    pub fn ledger(&self) -> &Arc<Ledger<C::State>> {
        &self.ledger
    }

    pub fn ledger_hash(&self) -> &str {
        &self.ledger_hash
    }

    pub fn previous_header(&self) -> Option<&Signature> {
        self.previous_header.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn proposer(&self) -> &PublicKey {
        &self.proposer
    }

    pub fn header(&self) -> &Signature {
        &self.header
    }

    /// First block after the initial ledger.
    pub fn is_genesis(&self) -> bool {
        self.previous_header.is_none()
    }

    /// Header signature holds and the embedded snapshot matches its hash.
    pub fn verify(&self) -> bool {
        let contents = header_contents(
            self.previous_header.as_ref(),
            &self.transactions,
            &self.ledger_hash,
            &self.timestamp,
        );
        self.ledger.content_hash() == self.ledger_hash
            && self.proposer.verify(contents.as_bytes(), &self.header)
    }

    pub fn record(&self) -> BlockRecord {
        BlockRecord {
            previous_header: self.previous_header.as_ref().map(Signature::to_base64),
            transactions: self.transactions.iter().map(|tx| tx.signature().to_base64()).collect(),
            ledger_hash: self.ledger_hash.clone(),
            timestamp: format_time(&self.timestamp),
            header: self.header.to_base64(),
            proposer: self.proposer.fingerprint().to_hex(),
        }
    }
}

impl<C: Content> PartialEq for Block<C> {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header
    }
}

impl<C: Content> Eq for Block<C> {}

fn header_contents<C: Content>(
    previous_header: Option<&Signature>,
    transactions: &[Transaction<C>],
    ledger_hash: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    let mut parts = Vec::with_capacity(transactions.len() + 3);
    parts.push(previous_header.map(Signature::to_base64).unwrap_or_default());
    parts.extend(transactions.iter().map(|tx| tx.signature().to_base64()));
    parts.push(ledger_hash.to_string());
    parts.push(format_time(timestamp));
    parts.join(":")
}
