//! Table driven state machines.
//!
//! Each transaction kind is described by a static table of
//! `(state, input) -> (next state, action)` rows. The transaction moves to
//! the next state *before* running the action, and an action may yield a
//! follow-up input that is fed back into the table (for example a failed
//! send yields a transport error input). A missing row is an error: the
//! tables list every input a state is expected to see, including the ones
//! it ignores.

use std::fmt;

/// State of a SIP transaction, named after the RFC 3261 diagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Client INVITE: request sent, nothing received yet
    Calling,
    /// Client non-INVITE: request sent; server non-INVITE: request received
    Trying,
    /// A provisional response was received (client) or sent (server)
    Proceeding,
    /// A final response was received (client) or sent (server)
    Completed,
    /// Server INVITE: ACK received for a non-2xx final response
    Confirmed,
    /// INVITE: a 2xx was received (client) or sent (server)
    Accepted,
    Terminated,
}

impl TransactionState {
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Accepted => "Accepted",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// One row of a transition table
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transition<I, A> {
    pub from: TransactionState,
    pub input: I,
    pub to: TransactionState,
    pub action: A,
}

/// Shorthand for building table rows
pub(crate) const fn row<I, A>(
    from: TransactionState,
    input: I,
    to: TransactionState,
    action: A,
) -> Transition<I, A> {
    Transition {
        from,
        input,
        to,
        action,
    }
}

/// Look up the row for `input` in `state`.
pub(crate) fn lookup<I, A>(
    table: &[Transition<I, A>],
    state: TransactionState,
    input: I,
) -> Option<(TransactionState, A)>
where
    I: PartialEq + Copy,
    A: Copy,
{
    table
        .iter()
        .find(|t| t.from == state && t.input == input)
        .map(|t| (t.to, t.action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionState::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Input {
        Go,
        Stop,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Action {
        Start,
        Nothing,
    }

    const TABLE: &[Transition<Input, Action>] = &[
        row(Trying, Input::Go, Proceeding, Action::Start),
        row(Proceeding, Input::Go, Proceeding, Action::Nothing),
        row(Proceeding, Input::Stop, Terminated, Action::Nothing),
    ];

    #[test]
    fn test_lookup() {
        assert_eq!(lookup(TABLE, Trying, Input::Go), Some((Proceeding, Action::Start)));
        assert_eq!(lookup(TABLE, Proceeding, Input::Stop), Some((Terminated, Action::Nothing)));
        assert_eq!(lookup(TABLE, Trying, Input::Stop), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(Accepted.to_string(), "Accepted");
        assert!(Terminated.is_terminated());
    }
}
