//! Ordered strategy chains
//!
//! The chat client's markup changes between versions, so both element lookup
//! and text insertion try a list of strategies in priority order and take the
//! first one that works.

use crate::error::Error;
use std::fmt;

/// Every strategy in a chain failed
#[derive(Debug, Clone, PartialEq)]
pub struct ChainFailure {
    /// (strategy label, error text) in the order they were tried
    pub attempts: Vec<(String, String)>,
    /// The chain stopped early because the browser session went away
    pub session_lost: bool,
}

impl fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "no strategies to try");
        }
        let parts: Vec<String> = self
            .attempts
            .iter()
            .map(|(label, err)| format!("{}: {}", label, err))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Try `attempt` on each candidate in order; return the first success with its index
pub fn first_success<C, T, F>(candidates: &[C], mut attempt: F) -> Result<(usize, T), ChainFailure>
where
    C: fmt::Display,
    F: FnMut(&C) -> Result<T, Error>,
{
    let mut failure = ChainFailure {
        attempts: Vec::new(),
        session_lost: false,
    };

    for (idx, candidate) in candidates.iter().enumerate() {
        match attempt(candidate) {
            Ok(value) => return Ok((idx, value)),
            Err(e) => {
                let lost = e.is_session_lost();
                failure.attempts.push((candidate.to_string(), e.to_string()));
                if lost {
                    failure.session_lost = true;
                    break;
                }
            }
        }
    }

    Err(failure)
}
