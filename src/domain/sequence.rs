//! Placeholder unit of work executed by workers
//!
//! Requests carry a decimal integer `n` and are answered with the `n`-th value of the counting
//! sequence `0, 0, 1, 1, 2, 3, 5, 8, 13, 21, 34, ...` rendered as decimal text. Every value past
//! the second is the sum of its two predecessors, so `10` yields `34`.

use crate::library::communication::request::{RequestProcessor, WorkError};
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

/// Error that occurs when computing a sequence value
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    /// Value does not fit into 64 bits
    #[error("sequence value for {0} exceeds the representable range")]
    Overflow(i64),
}

/// Computes the `n`-th value of the counting sequence
///
/// Positions below two yield zero.
pub fn value(n: i64) -> Result<u64, SequenceError> {
    if n <= 1 {
        return Ok(0);
    }

    let (mut previous, mut current) = (0u64, 1u64);

    for _ in 2..n {
        let next = previous
            .checked_add(current)
            .ok_or(SequenceError::Overflow(n))?;

        previous = current;
        current = next;
    }

    Ok(current)
}

/// Parses a request body into a sequence position
pub fn parse(body: &[u8]) -> Result<i64, WorkError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| WorkError::MalformedInput("body is not valid UTF-8".into()))?;

    text.trim()
        .parse()
        .map_err(|e| WorkError::MalformedInput(format!("'{}' is not an integer: {}", text, e)))
}

/// [`RequestProcessor`] answering requests with counting sequence values
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceProcessor;

#[async_trait]
impl RequestProcessor for SequenceProcessor {
    async fn process(&self, body: &[u8]) -> Result<Vec<u8>, WorkError> {
        let n = parse(body)?;
        info!(n, "Computing sequence value");

        let result = value(n).map_err(|e| WorkError::ComputationFailed(Box::new(e)))?;

        Ok(result.to_string().into_bytes())
    }
}
