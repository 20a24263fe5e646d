//! Validator modes define which on-chain actions a validator is allowed to take.
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The operating mode of a validator. Modes are totally ordered: each mode can do
/// everything the previous one does, plus something more.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Only observes the chain and reports disagreements. Never writes.
    #[default]
    Watchtower,
    /// Confirms assertions it agrees with, but never posts.
    Resolve,
    /// Posts rivals and opens challenges when it sees a fork.
    Defensive,
    /// Posts its own assertions at every interval.
    Make,
}

impl Mode {
    /// Whether this mode is allowed to confirm assertions.
    pub fn supports_confirming(&self) -> bool {
        *self >= Mode::Resolve
    }

    /// Whether this mode is allowed to post rival assertions.
    pub fn supports_posting_rivals(&self) -> bool {
        *self >= Mode::Defensive
    }

    /// Whether this mode is allowed to open challenges.
    pub fn supports_posting_challenges(&self) -> bool {
        *self >= Mode::Defensive
    }

    /// Whether this mode posts its own assertions on a schedule.
    pub fn supports_posting_assertions(&self) -> bool {
        *self >= Mode::Make
    }

    /// Whether this mode is allowed to stake at all.
    pub fn supports_staking(&self) -> bool {
        *self > Mode::Watchtower
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Mode::Watchtower => "watchtower",
            Mode::Resolve => "resolve",
            Mode::Defensive => "defensive",
            Mode::Make => "make",
        };
        f.write_str(mode)
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "watchtower" => Ok(Mode::Watchtower),
            "resolve" => Ok(Mode::Resolve),
            "defensive" => Ok(Mode::Defensive),
            "make" => Ok(Mode::Make),
            other => Err(anyhow::anyhow!("unknown validator mode: {}", other)),
        }
    }
}
