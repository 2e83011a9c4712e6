//! Connection State Machine
//!
//! Defines the lifecycle of one logical channel and the retry accounting
//! that goes with it. The machine is pure: it decides the next state and
//! how long to back off, the runtime owns sockets and timers.

use std::fmt;
use std::time::Duration;

use crate::{backoff::BackoffPolicy, defaults};

/// Lifecycle states of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// First open attempt after creation
    Start,
    /// Transport reports the socket is open
    Opened,
    /// Transport failed to open or the socket closed; `None` means no close code
    SocketClosed { code: Option<u16> },
    /// Backoff timer fired
    RetryDue,
    /// Caller asked to connect again; attempts start over
    Restart,
    /// Explicit disconnect
    DisconnectRequested,
    /// The normal-closure request was handed to the socket
    CloseConfirmed,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Plain state change
    Moved {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Abnormal close with attempts left; the caller arms a retry timer
    ScheduleRetry {
        from: ConnectionState,
        delay: Duration,
        attempt: u32,
    },
    /// Abnormal close with no attempts left; now `Closed`
    Exhausted {
        from: ConnectionState,
        attempts: u32,
    },
    /// Event does not apply in the current state; nothing changed
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

impl Transition {
    /// State after the transition, if it changed
    pub fn target(&self) -> Option<ConnectionState> {
        match self {
            Transition::Moved { to, .. } => Some(*to),
            Transition::ScheduleRetry { .. } => Some(ConnectionState::Reconnecting),
            Transition::Exhausted { .. } => Some(ConnectionState::Closed),
            Transition::Invalid { .. } => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Transition::Invalid { .. })
    }
}

/// Lifecycle state plus reconnect accounting for one connection
#[derive(Debug, Clone)]
pub struct LinkStateMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    backoff: BackoffPolicy,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new(BackoffPolicy::default(), defaults::MAX_RECONNECT_ATTEMPTS)
    }
}

impl LinkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new(backoff: BackoffPolicy, max_reconnect_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> Transition {
        use ConnectionState::*;

        let from = self.state;

        match (from, event) {
            (Idle, LinkEvent::Start) => self.move_to(Connecting),

            (Connecting, LinkEvent::Opened) => {
                self.reconnect_attempts = 0;
                self.move_to(Open)
            }

            (Connecting | Open, LinkEvent::SocketClosed { code }) => {
                if code == Some(defaults::NORMAL_CLOSURE) {
                    self.move_to(Closed)
                } else {
                    self.schedule_retry()
                }
            }

            // The close we asked for came back
            (Closing, LinkEvent::SocketClosed { .. } | LinkEvent::CloseConfirmed) => {
                self.move_to(Closed)
            }

            (Reconnecting, LinkEvent::RetryDue) => self.move_to(Connecting),

            (Idle | Reconnecting | Closed, LinkEvent::Restart) => {
                self.reconnect_attempts = 0;
                self.move_to(Connecting)
            }

            (Idle | Connecting | Open | Reconnecting | Closed, LinkEvent::DisconnectRequested) => {
                self.move_to(Closing)
            }

            _ => Transition::Invalid { from, event },
        }
    }

    fn move_to(&mut self, to: ConnectionState) -> Transition {
        let from = self.state;
        self.state = to;
        Transition::Moved { from, to }
    }

    fn schedule_retry(&mut self) -> Transition {
        let from = self.state;

        if self.reconnect_attempts >= self.max_reconnect_attempts {
            self.state = ConnectionState::Closed;
            return Transition::Exhausted {
                from,
                attempts: self.reconnect_attempts,
            };
        }

        let delay = self.backoff.delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.state = ConnectionState::Reconnecting;

        Transition::ScheduleRetry {
            from,
            delay,
            attempt: self.reconnect_attempts,
        }
    }
}

/// Check if a transition from one state to another is generally valid
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (Idle, Connecting) => true,
        (Connecting, Open | Reconnecting | Closed) => true,
        (Open, Reconnecting | Closed) => true,
        (Reconnecting | Closed, Connecting) => true,
        (Closing, Closed) => true,
        (Closing, _) => false,
        (_, Closing) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> LinkStateMachine {
        LinkStateMachine::new(BackoffPolicy::new(3000, 30_000), max_attempts)
    }

    fn abnormal() -> LinkEvent {
        LinkEvent::SocketClosed { code: Some(1006) }
    }

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::default();
        assert_eq!(fsm.state(), ConnectionState::Idle);
        assert_eq!(fsm.reconnect_attempts(), 0);
    }

    #[test]
    fn test_happy_path() {
        let mut fsm = machine(5);

        let result = fsm.process_event(LinkEvent::Start);
        assert_eq!(result.target(), Some(ConnectionState::Connecting));

        let result = fsm.process_event(LinkEvent::Opened);
        assert!(matches!(
            result,
            Transition::Moved {
                from: ConnectionState::Connecting,
                to: ConnectionState::Open
            }
        ));
    }

    #[test]
    fn test_abnormal_close_schedules_backoff() {
        let mut fsm = machine(5);
        fsm.process_event(LinkEvent::Start);
        fsm.process_event(LinkEvent::Opened);

        let result = fsm.process_event(abnormal());
        assert_eq!(
            result,
            Transition::ScheduleRetry {
                from: ConnectionState::Open,
                delay: Duration::from_millis(3000),
                attempt: 1,
            }
        );
        assert_eq!(fsm.state(), ConnectionState::Reconnecting);

        fsm.process_event(LinkEvent::RetryDue);
        let result = fsm.process_event(LinkEvent::SocketClosed { code: None });
        assert!(matches!(
            result,
            Transition::ScheduleRetry { delay, attempt: 2, .. } if delay == Duration::from_millis(6000)
        ));
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut fsm = machine(5);
        fsm.process_event(LinkEvent::Start);
        fsm.process_event(abnormal());
        fsm.process_event(LinkEvent::RetryDue);
        fsm.process_event(abnormal());
        assert_eq!(fsm.reconnect_attempts(), 2);

        fsm.process_event(LinkEvent::RetryDue);
        fsm.process_event(LinkEvent::Opened);
        assert_eq!(fsm.reconnect_attempts(), 0);
    }

    #[test]
    fn test_normal_close_is_terminal() {
        let mut fsm = machine(5);
        fsm.process_event(LinkEvent::Start);
        fsm.process_event(LinkEvent::Opened);

        let result = fsm.process_event(LinkEvent::SocketClosed { code: Some(1000) });
        assert_eq!(result.target(), Some(ConnectionState::Closed));
        assert_eq!(fsm.reconnect_attempts(), 0);

        // No retry from a terminal state
        let result = fsm.process_event(LinkEvent::RetryDue);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_exhausted_after_max_attempts() {
        let mut fsm = machine(3);
        fsm.process_event(LinkEvent::Start);

        for _ in 0..3 {
            let result = fsm.process_event(abnormal());
            assert!(matches!(result, Transition::ScheduleRetry { .. }));
            fsm.process_event(LinkEvent::RetryDue);
        }

        let result = fsm.process_event(abnormal());
        assert_eq!(
            result,
            Transition::Exhausted {
                from: ConnectionState::Connecting,
                attempts: 3
            }
        );
        assert_eq!(fsm.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_restart_from_closed_resets_attempts() {
        let mut fsm = machine(1);
        fsm.process_event(LinkEvent::Start);
        fsm.process_event(abnormal());
        fsm.process_event(LinkEvent::RetryDue);
        fsm.process_event(abnormal());
        assert_eq!(fsm.state(), ConnectionState::Closed);

        let result = fsm.process_event(LinkEvent::Restart);
        assert_eq!(result.target(), Some(ConnectionState::Connecting));
        assert_eq!(fsm.reconnect_attempts(), 0);
    }

    #[test]
    fn test_restart_rejected_while_open() {
        let mut fsm = machine(5);
        fsm.process_event(LinkEvent::Start);
        fsm.process_event(LinkEvent::Opened);

        let result = fsm.process_event(LinkEvent::Restart);
        assert!(matches!(result, Transition::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Open);
    }

    #[test]
    fn test_disconnect_goes_through_closing() {
        let mut fsm = machine(5);
        fsm.process_event(LinkEvent::Start);
        fsm.process_event(LinkEvent::Opened);

        let result = fsm.process_event(LinkEvent::DisconnectRequested);
        assert_eq!(result.target(), Some(ConnectionState::Closing));

        // An abnormal close while closing still ends in Closed, never a retry
        let result = fsm.process_event(abnormal());
        assert_eq!(result.target(), Some(ConnectionState::Closed));
    }

    #[test]
    fn test_stale_events_are_invalid() {
        let mut fsm = machine(5);
        assert!(!fsm.process_event(LinkEvent::Opened).is_valid());
        assert!(!fsm.process_event(abnormal()).is_valid());
        assert_eq!(fsm.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;
        assert!(is_valid_transition(Idle, Connecting));
        assert!(is_valid_transition(Open, Reconnecting));
        assert!(is_valid_transition(Reconnecting, Connecting));
        assert!(is_valid_transition(Open, Closing));
        assert!(is_valid_transition(Closing, Closed));
        assert!(!is_valid_transition(Idle, Open));
        assert!(!is_valid_transition(Closing, Connecting));
        assert!(!is_valid_transition(Reconnecting, Open));
    }
}
