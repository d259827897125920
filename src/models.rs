use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Fingerprint;
use crate::ledger::Ledger;
use crate::state::EntityState;

/// Exchanged/persisted form of a block: the hash-linked log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub previous_header: Option<String>,
    pub transactions: Vec<String>,
    pub ledger_hash: String,
    pub timestamp: String,
    pub header: String,
    pub proposer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    pub kind: String,
    pub entity: String,
    pub issuer: Fingerprint,
    pub previous_state: String,
    pub new_state: String,
    pub timestamp: Option<String>,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyEntry {
    pub item: String,
    pub choice: String,
    pub votes: u64,
}

/// Read-only view of a ledger snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub entities: u64,
    pub counts: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tallies: Vec<TallyEntry>,
    pub content_hash: String,
}

impl<S: EntityState> From<&Ledger<S>> for LedgerSummary {
    fn from(ledger: &Ledger<S>) -> Self {
        LedgerSummary {
            entities: ledger.total_entities(),
            counts: ledger
                .aggregate_counts()
                .iter()
                .map(|(state, count)| (state.as_str().to_string(), *count))
                .collect(),
            tallies: ledger
                .tallies()
                .iter()
                .map(|(key, votes)| TallyEntry {
                    item: key.item.clone(),
                    choice: key.choice.clone(),
                    votes: *votes,
                })
                .collect(),
            content_hash: ledger.content_hash(),
        }
    }
}
