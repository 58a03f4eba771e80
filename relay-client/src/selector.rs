//! Picks the message that answers a call out of everything a process emitted.
//!
//! Writes routinely produce several side-effect messages (notifications,
//! forwards) next to the actual reply; the reply is the one whose `Action`
//! ends in `Response`. Reads have no such step: anything other than exactly
//! one message is an error.

use relay_types::{ResultMessage, RESPONSE_SUFFIX};

use crate::codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("no messages returned")]
    NoMessages,
    #[error("expected exactly one message, got {0}")]
    Ambiguous(usize),
}

/// Write-path selection.
///
/// A single message is returned as is. With several, the last `…Response`
/// message wins; when none is tagged that way the first message is returned.
pub fn select_response(messages: &[ResultMessage]) -> Result<&ResultMessage, SelectError> {
    match messages {
        [] => Err(SelectError::NoMessages),
        [only] => Ok(only),
        [first, ..] => Ok(messages
            .iter()
            .rev()
            .find(|message| is_response(message))
            .unwrap_or(first)),
    }
}

/// Read-path selection: exactly one message or an error.
pub fn select_single(messages: &[ResultMessage]) -> Result<&ResultMessage, SelectError> {
    match messages {
        [] => Err(SelectError::NoMessages),
        [only] => Ok(only),
        many => Err(SelectError::Ambiguous(many.len())),
    }
}

fn is_response(message: &ResultMessage) -> bool {
    codec::decode(&message.tags)
        .action()
        .is_some_and(|action| action.ends_with(RESPONSE_SUFFIX))
}
