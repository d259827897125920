use std::fmt;
use std::hash::Hash;

use serde::Serialize;

use crate::error::ValidationError;

/// A finite, linearly ordered state set for one entity kind.
///
/// `ALL` lists the states in transition order; the only legal edges are
/// between neighbours, so a state's successor is the next entry.
pub trait EntityState:
    Copy + fmt::Debug + fmt::Display + Eq + Ord + Hash + Send + Sync + Serialize + 'static
{
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    fn initial() -> Self {
        Self::ALL[0]
    }

    fn successor(self) -> Option<Self> {
        let position = Self::ALL.iter().position(|state| *state == self)?;
        Self::ALL.get(position + 1).copied()
    }

    /// The consumed state; ballots entering it carry countable choices.
    fn is_terminal(self) -> bool {
        self.successor().is_none()
    }

    fn is_legal(from: Self, to: Self) -> bool {
        from.successor() == Some(to)
    }

    /// Longest legal transition chain, i.e. the replay pass bound.
    fn max_chain() -> usize {
        Self::ALL.len().saturating_sub(1)
    }

    fn parse(name: &str) -> Result<Self, ValidationError> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == name)
            .ok_or_else(|| ValidationError::UnknownState(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum VoterState {
    #[serde(rename = "not voted")]
    NotVoted,
    #[serde(rename = "voted")]
    Voted,
}

impl EntityState for VoterState {
    const ALL: &'static [Self] = &[VoterState::NotVoted, VoterState::Voted];

    fn as_str(self) -> &'static str {
        match self {
            VoterState::NotVoted => "not voted",
            VoterState::Voted => "voted",
        }
    }
}

impl fmt::Display for VoterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum BallotState {
    #[serde(rename = "ballot_created")]
    Created,
    #[serde(rename = "ballot_issued")]
    Issued,
    #[serde(rename = "ballot_used")]
    Used,
}

impl EntityState for BallotState {
    const ALL: &'static [Self] = &[BallotState::Created, BallotState::Issued, BallotState::Used];

    fn as_str(self) -> &'static str {
        match self {
            BallotState::Created => "ballot_created",
            BallotState::Issued => "ballot_issued",
            BallotState::Used => "ballot_used",
        }
    }
}

impl fmt::Display for BallotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
