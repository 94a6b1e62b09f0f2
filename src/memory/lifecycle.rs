//! Process and session lifecycle
//!
//! `Stopped -> Starting -> Ready -> InSession`, with `InSession -> Ready` when a
//! session ends and any state `-> Stopped` when the process is lost. Each
//! transition publishes its events to every subscriber. The lifecycle also
//! hands out the restart token that long-running loops observe.

use crate::task::CancellationToken;
use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

/// Where the worker currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No process attached
    Stopped,
    /// Looking for / attaching to the process
    Starting,
    /// Attached, waiting for a session
    Ready,
    /// A session is running
    InSession,
}

/// Notifications published on transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// Attach attempts began
    ProcessStarting,
    /// Process attached and readable
    ProcessStarted,
    /// Process gone or detached
    ProcessStopped,
    /// A session world came up
    SessionStarted,
    /// The session ended; session-scoped state must be dropped
    SessionStopped,
}

/// Lifecycle state machine with event fan-out and restart tokens
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    subscribers: Mutex<Vec<Sender<LifecycleEvent>>>,
    root: Mutex<CancellationToken>,
    current: Mutex<CancellationToken>,
}

impl Lifecycle {
    /// Start in `Stopped` with a fresh restart token
    pub fn new() -> Self {
        let root = CancellationToken::new();
        let current = root.child();
        Self {
            state: Mutex::new(LifecycleState::Stopped),
            subscribers: Mutex::new(Vec::new()),
            root: Mutex::new(root),
            current: Mutex::new(current),
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Move to `to`, publishing the events that transition implies
    ///
    /// Moving to the current state is a no-op.
    pub fn transition(&self, to: LifecycleState) -> Result<()> {
        let events = {
            let mut state = self.state.lock();
            let from = *state;
            if from == to {
                return Ok(());
            }

            let events = events_for(from, to).ok_or(Error::InvalidTransition { from, to })?;
            *state = to;
            info!(?from, ?to, "Lifecycle transition");
            events
        };

        for &event in events {
            self.publish(event);
        }
        Ok(())
    }

    fn publish(&self, event: LifecycleEvent) {
        // Receivers that were dropped are pruned on the way
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event).is_ok());
    }

    /// Token for the current run; cancelled by [`Lifecycle::restart`]
    pub fn token(&self) -> CancellationToken {
        self.current.lock().clone()
    }

    /// Cancel the current token and issue a new one
    pub fn restart(&self) -> CancellationToken {
        let root = self.root.lock().clone();
        let mut current = self.current.lock();
        current.cancel();
        *current = root.child();
        info!("Restart requested");
        current.clone()
    }

    /// Make every future token a child of `parent`
    ///
    /// Used by the worker so that cancelling the worker also cancels the
    /// run it is in the middle of.
    pub fn adopt(&self, parent: &CancellationToken) {
        let mut root = self.root.lock();
        let mut current = self.current.lock();
        current.cancel();
        *root = parent.clone();
        *current = parent.child();
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn events_for(from: LifecycleState, to: LifecycleState) -> Option<&'static [LifecycleEvent]> {
    use LifecycleEvent::*;
    use LifecycleState::*;

    match (from, to) {
        (Stopped, Starting) => Some(&[ProcessStarting]),
        (Starting, Ready) => Some(&[ProcessStarted]),
        (Ready, InSession) => Some(&[SessionStarted]),
        (InSession, Ready) => Some(&[SessionStopped]),
        (InSession, Stopped) => Some(&[SessionStopped, ProcessStopped]),
        (Starting | Ready, Stopped) => Some(&[ProcessStopped]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(receiver: &Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
        receiver.try_iter().collect()
    }

    #[test]
    fn test_full_cycle_events() {
        let lifecycle = Lifecycle::new();
        let events = lifecycle.subscribe();

        lifecycle.transition(LifecycleState::Starting).unwrap();
        lifecycle.transition(LifecycleState::Ready).unwrap();
        lifecycle.transition(LifecycleState::InSession).unwrap();
        lifecycle.transition(LifecycleState::Ready).unwrap();
        lifecycle.transition(LifecycleState::InSession).unwrap();
        lifecycle.transition(LifecycleState::Stopped).unwrap();

        assert_eq!(
            drain(&events),
            vec![
                LifecycleEvent::ProcessStarting,
                LifecycleEvent::ProcessStarted,
                LifecycleEvent::SessionStarted,
                LifecycleEvent::SessionStopped,
                LifecycleEvent::SessionStarted,
                LifecycleEvent::SessionStopped,
                LifecycleEvent::ProcessStopped,
            ]
        );
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let lifecycle = Lifecycle::new();
        let result = lifecycle.transition(LifecycleState::InSession);
        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                from: LifecycleState::Stopped,
                to: LifecycleState::InSession
            })
        ));
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_same_state_is_silent() {
        let lifecycle = Lifecycle::new();
        let events = lifecycle.subscribe();
        lifecycle.transition(LifecycleState::Stopped).unwrap();
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let lifecycle = Lifecycle::new();
        let kept = lifecycle.subscribe();
        drop(lifecycle.subscribe());

        lifecycle.transition(LifecycleState::Starting).unwrap();
        assert_eq!(lifecycle.subscribers.lock().len(), 1);
        assert_eq!(drain(&kept), vec![LifecycleEvent::ProcessStarting]);
    }

    #[test]
    fn test_restart_reissues_token() {
        let lifecycle = Lifecycle::new();
        let first = lifecycle.token();

        let second = lifecycle.restart();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!lifecycle.token().is_cancelled());
    }

    #[test]
    fn test_adopted_parent_cancels_tokens() {
        let lifecycle = Lifecycle::new();
        let parent = CancellationToken::new();
        lifecycle.adopt(&parent);

        let token = lifecycle.token();
        parent.cancel();
        assert!(token.is_cancelled());
        assert!(lifecycle.restart().is_cancelled());
    }
}
