use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Instance number of one independent round of agreement.
pub type Instance = u64;

/// A proposal number `(round, proposer)`.
///
/// Ordered by `round` first and then lexicographically by `proposer`, so
/// numbers chosen independently by different proposers never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProposalNumber {
    pub round: u64,
    pub proposer: String,
}

impl ProposalNumber {
    /// "No proposal": lower than every number a proposer can issue.
    pub const ZERO: ProposalNumber = ProposalNumber {
        round: 0,
        proposer: String::new(),
    };

    pub fn new(round: u64, proposer: &str) -> Self {
        ProposalNumber {
            round,
            proposer: proposer.to_string(),
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Ord for ProposalNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.round
            .cmp(&other.round)
            .then_with(|| self.proposer.cmp(&other.proposer))
    }
}

impl PartialOrd for ProposalNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ProposalNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.round, self.proposer)
    }
}
