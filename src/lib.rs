//! Replicated, signed ledgers for running a polling place: ballots move from
//! created to issued to used, voters from not voted to voted, and every
//! transition is signed, replayed and chained at each node.

pub mod api;
pub mod block;
pub mod chain;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod election;
pub mod error;
pub mod ledger;
pub mod models;
pub mod network;
pub mod node;
pub mod precinct;
pub mod state;
pub mod store;
pub mod transaction;

pub use error::Error;
