//! Generic finite-state-machine primitive.
//!
//! Every session owns one or more of these, built from a transition table
//! registered at session setup. The machine itself knows nothing about
//! drives or sockets; engines bind behavior to transitions through
//! callbacks closing over their session context.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::{Result, TapeBridgeError};

/// A directed edge in a session's state graph. Immutable once registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
}

/// Unit of work bound to a transition, run synchronously during `fire`
/// against the session context.
pub type Callback<C> = Box<dyn FnMut(&mut C) -> Result<()> + Send>;

struct Entry<S, C> {
    to: S,
    callback: Option<Callback<C>>,
}

/// A state machine instance with table keyed by `(from, event)`.
///
/// At most one transition may match a given `(from, event)` pair;
/// registering a second is a configuration error, not a runtime one.
pub struct StateMachine<S, E, C> {
    current: S,
    transitions: HashMap<(S, E), Entry<S, C>>,
}

impl<S, E, C> StateMachine<S, E, C>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            transitions: HashMap::new(),
        }
    }

    /// Register a transition, optionally bound to a callback.
    ///
    /// Fails with `Conflict` if a transition for the same `(from, event)`
    /// pair already exists.
    pub fn register(
        &mut self,
        transition: Transition<S, E>,
        callback: Option<Callback<C>>,
    ) -> Result<()> {
        let key = (transition.from, transition.event);
        if self.transitions.contains_key(&key) {
            return Err(TapeBridgeError::conflict(format!(
                "duplicate transition from {:?} on {:?}",
                transition.from, transition.event
            )));
        }
        self.transitions.insert(
            key,
            Entry {
                to: transition.to,
                callback,
            },
        );
        Ok(())
    }

    /// Fire an event against the current state.
    ///
    /// If no transition matches, the state is left untouched and
    /// `IllegalTransition` is returned. If the bound callback fails, the
    /// state is also left untouched and the callback's error propagates.
    /// Otherwise the machine moves to the target state and returns it.
    pub fn fire(&mut self, event: E, ctx: &mut C) -> Result<S> {
        let key = (self.current, event);
        let entry = self.transitions.get_mut(&key).ok_or_else(|| {
            TapeBridgeError::illegal_transition(format!(
                "event {:?} not valid in state {:?}",
                event, self.current
            ))
        })?;
        let to = entry.to;
        if let Some(callback) = entry.callback.as_mut() {
            callback(ctx)?;
        }
        self.current = to;
        Ok(to)
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// True when no transition leaves the current state.
    pub fn is_terminal(&self) -> bool {
        !self.transitions.keys().any(|(from, _)| *from == self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum State {
        Idle,
        Busy,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Event {
        Start,
        Finish,
    }

    fn machine() -> StateMachine<State, Event, u32> {
        let mut fsm = StateMachine::new(State::Idle);
        fsm.register(
            Transition {
                from: State::Idle,
                to: State::Busy,
                event: Event::Start,
            },
            None,
        )
        .unwrap();
        fsm.register(
            Transition {
                from: State::Busy,
                to: State::Done,
                event: Event::Finish,
            },
            None,
        )
        .unwrap();
        fsm
    }

    #[test]
    fn walks_registered_transitions() {
        let mut fsm = machine();
        assert_eq!(fsm.current(), State::Idle);
        assert_eq!(fsm.fire(Event::Start, &mut 0).unwrap(), State::Busy);
        assert_eq!(fsm.fire(Event::Finish, &mut 0).unwrap(), State::Done);
        assert!(fsm.is_terminal());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let mut fsm = machine();
        let result = fsm.register(
            Transition {
                from: State::Idle,
                to: State::Done,
                event: Event::Start,
            },
            None,
        );
        assert!(matches!(result, Err(TapeBridgeError::Conflict(_))));
    }

    #[test]
    fn undefined_event_leaves_state_unchanged() {
        let mut fsm = machine();
        let result = fsm.fire(Event::Finish, &mut 0);
        assert!(matches!(result, Err(TapeBridgeError::IllegalTransition(_))));
        assert_eq!(fsm.current(), State::Idle);
    }

    #[test]
    fn callback_sees_session_context() {
        let mut fsm: StateMachine<State, Event, u32> = StateMachine::new(State::Idle);
        fsm.register(
            Transition {
                from: State::Idle,
                to: State::Busy,
                event: Event::Start,
            },
            Some(Box::new(|count: &mut u32| {
                *count += 1;
                Ok(())
            })),
        )
        .unwrap();

        let mut count = 0;
        fsm.fire(Event::Start, &mut count).unwrap();
        assert_eq!(count, 1);
        assert_eq!(fsm.current(), State::Busy);
    }

    #[test]
    fn failing_callback_blocks_the_transition() {
        let mut fsm: StateMachine<State, Event, u32> = StateMachine::new(State::Idle);
        fsm.register(
            Transition {
                from: State::Idle,
                to: State::Busy,
                event: Event::Start,
            },
            Some(Box::new(|_: &mut u32| {
                Err(TapeBridgeError::drive("mount refused"))
            })),
        )
        .unwrap();

        let result = fsm.fire(Event::Start, &mut 0);
        assert!(matches!(result, Err(TapeBridgeError::Drive(_))));
        assert_eq!(fsm.current(), State::Idle);
    }
}
