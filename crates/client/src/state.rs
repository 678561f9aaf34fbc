//! Per-connection state machine.
//!
//! Transitions are pure: [`transition`] maps (state, event) to (new state,
//! effects) and performs no I/O.  The worker driver owns the transport and
//! executes the effects; everything that can be unit-tested without a
//! socket lives here.

use crate::types::ConnectionStatus;

/// Close codes treated as a graceful shutdown (normal / going-away).
pub const NORMAL_CLOSE: u16 = 1000;
pub const GOING_AWAY: u16 = 1001;

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

fn is_graceful(code: u16) -> bool {
    code == NORMAL_CLOSE || code == GOING_AWAY
}

/// Machine state of one named connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Open,
    /// A reconnect task is pending; the transport has been released.
    Reconnecting,
    /// Terminal: graceful local or remote shutdown.
    Closed,
}

/// Why a reconnect was scheduled.  Maps to a delay via
/// [`ReconnectPolicy`](crate::scheduler::ReconnectPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    AbnormalClose,
    TransportError,
    ConnectFailure,
}

/// Everything that can happen to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Initial start or a manual reconnect request.
    Start,
    /// Transport construction failed.
    ConnectFailed,
    /// Transport handshake completed.
    TransportOpened,
    /// An inbound frame arrived (valid or not).
    FrameReceived,
    /// Transport closed with the given code.
    TransportClosed { code: u16 },
    /// Transport-level error.
    TransportError,
    /// The scheduled reconnect task fired.
    RetryFired,
    /// Local teardown request from the supervisor.
    Teardown,
}

/// Side effects the driver must execute after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Release any prior transport for this name and open a new one.
    OpenTransport,
    /// Send the `join` frame for the configured room.
    SendJoin,
    /// Cancel any pending reconnect task for this name.
    CancelPendingReconnect,
    /// Append the "connected" system message.
    RecordConnected,
    /// Append the "disconnected (code)" system message.
    RecordDisconnected { code: u16 },
    /// Decode the inbound frame and run it through the dedup path.
    HandleFrame,
    /// Schedule exactly one reconnect task, replacing any pending one.
    ScheduleReconnect {
        reason: ReconnectReason,
        status: ConnectionStatus,
    },
    /// Send the `leave` frame (transport is open).
    SendLeave,
    /// Close the transport with the normal code.
    CloseTransport,
    /// Drop the transport / in-flight attempt without a close handshake.
    DiscardTransport,
}

/// Pure transition function.  Unknown (state, event) pairs are ignored:
/// stale transport events after teardown, frames outside `Open`, and the
/// like must never crash or re-animate a closed connection.
pub fn transition(state: WorkerState, event: WorkerEvent) -> (WorkerState, Vec<Effect>) {
    use ConnectionStatus as Status;
    use WorkerEvent as E;
    use WorkerState as S;

    match (state, event) {
        (S::Idle, E::Start) => (S::Connecting, vec![Effect::OpenTransport]),

        // Manual reconnect: restart the attempt from any state, bypassing
        // any pending backoff.
        (_, E::Start) => (
            S::Connecting,
            vec![Effect::CancelPendingReconnect, Effect::OpenTransport],
        ),

        (S::Reconnecting, E::RetryFired) => (S::Connecting, vec![Effect::OpenTransport]),

        (S::Connecting, E::ConnectFailed) => (
            S::Reconnecting,
            vec![Effect::ScheduleReconnect {
                reason: ReconnectReason::ConnectFailure,
                status: Status::Error,
            }],
        ),

        (S::Connecting, E::TransportOpened) => (
            S::Open,
            vec![
                Effect::SendJoin,
                Effect::CancelPendingReconnect,
                Effect::RecordConnected,
            ],
        ),

        (S::Open, E::FrameReceived) => (S::Open, vec![Effect::HandleFrame]),

        (S::Open | S::Connecting, E::TransportClosed { code }) if is_graceful(code) => {
            (S::Closed, vec![Effect::RecordDisconnected { code }])
        }

        (S::Open | S::Connecting, E::TransportClosed { code }) => (
            S::Reconnecting,
            vec![
                Effect::RecordDisconnected { code },
                Effect::ScheduleReconnect {
                    reason: ReconnectReason::AbnormalClose,
                    status: Status::Reconnecting,
                },
            ],
        ),

        (S::Open | S::Connecting, E::TransportError) => (
            S::Reconnecting,
            vec![Effect::ScheduleReconnect {
                reason: ReconnectReason::TransportError,
                status: Status::Error,
            }],
        ),

        (S::Open, E::Teardown) => (
            S::Closed,
            vec![
                Effect::SendLeave,
                Effect::CloseTransport,
                Effect::CancelPendingReconnect,
            ],
        ),

        (S::Connecting | S::Reconnecting, E::Teardown) => (
            S::Closed,
            vec![Effect::CancelPendingReconnect, Effect::DiscardTransport],
        ),

        (S::Idle | S::Closed, E::Teardown) => (S::Closed, vec![Effect::CancelPendingReconnect]),

        // Everything else: ignore.  Covers frames outside Open, duplicate
        // close events while already Reconnecting, and stale events after
        // Closed.
        (state, _) => (state, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus as Status;
    use WorkerEvent as E;
    use WorkerState as S;

    #[test]
    fn start_opens_transport() {
        let (state, effects) = transition(S::Idle, E::Start);
        assert_eq!(state, S::Connecting);
        assert_eq!(effects, vec![Effect::OpenTransport]);
    }

    #[test]
    fn open_sends_join_and_cancels_pending() {
        let (state, effects) = transition(S::Connecting, E::TransportOpened);
        assert_eq!(state, S::Open);
        assert_eq!(
            effects,
            vec![
                Effect::SendJoin,
                Effect::CancelPendingReconnect,
                Effect::RecordConnected,
            ]
        );
    }

    #[test]
    fn connect_failure_schedules_with_error_status() {
        let (state, effects) = transition(S::Connecting, E::ConnectFailed);
        assert_eq!(state, S::Reconnecting);
        assert_eq!(
            effects,
            vec![Effect::ScheduleReconnect {
                reason: ReconnectReason::ConnectFailure,
                status: Status::Error,
            }]
        );
    }

    #[test]
    fn graceful_close_is_terminal() {
        for code in [NORMAL_CLOSE, GOING_AWAY] {
            let (state, effects) = transition(S::Open, E::TransportClosed { code });
            assert_eq!(state, S::Closed);
            assert_eq!(effects, vec![Effect::RecordDisconnected { code }]);
        }
    }

    #[test]
    fn abnormal_close_schedules_reconnect() {
        let (state, effects) = transition(S::Open, E::TransportClosed { code: 1006 });
        assert_eq!(state, S::Reconnecting);
        assert_eq!(
            effects,
            vec![
                Effect::RecordDisconnected { code: 1006 },
                Effect::ScheduleReconnect {
                    reason: ReconnectReason::AbnormalClose,
                    status: Status::Reconnecting,
                },
            ]
        );
    }

    #[test]
    fn second_close_while_reconnecting_is_ignored() {
        // The transport is already released; a late close event must not
        // create a second pending task or another disconnect notice.
        let (state, effects) = transition(S::Reconnecting, E::TransportClosed { code: 1006 });
        assert_eq!(state, S::Reconnecting);
        assert!(effects.is_empty());
    }

    #[test]
    fn transport_error_schedules_with_error_status() {
        let (state, effects) = transition(S::Open, E::TransportError);
        assert_eq!(state, S::Reconnecting);
        assert_eq!(
            effects,
            vec![Effect::ScheduleReconnect {
                reason: ReconnectReason::TransportError,
                status: Status::Error,
            }]
        );
    }

    #[test]
    fn retry_reenters_connecting() {
        let (state, effects) = transition(S::Reconnecting, E::RetryFired);
        assert_eq!(state, S::Connecting);
        assert_eq!(effects, vec![Effect::OpenTransport]);
    }

    #[test]
    fn frames_outside_open_are_ignored() {
        for state in [S::Idle, S::Connecting, S::Reconnecting, S::Closed] {
            let (next, effects) = transition(state, E::FrameReceived);
            assert_eq!(next, state);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn teardown_while_open_leaves_then_closes() {
        let (state, effects) = transition(S::Open, E::Teardown);
        assert_eq!(state, S::Closed);
        assert_eq!(
            effects,
            vec![
                Effect::SendLeave,
                Effect::CloseTransport,
                Effect::CancelPendingReconnect,
            ]
        );
    }

    #[test]
    fn teardown_while_connecting_discards_without_leave() {
        for state in [S::Connecting, S::Reconnecting] {
            let (next, effects) = transition(state, E::Teardown);
            assert_eq!(next, S::Closed);
            assert_eq!(
                effects,
                vec![Effect::CancelPendingReconnect, Effect::DiscardTransport]
            );
        }
    }

    #[test]
    fn manual_restart_from_closed() {
        let (state, effects) = transition(S::Closed, E::Start);
        assert_eq!(state, S::Connecting);
        assert_eq!(
            effects,
            vec![Effect::CancelPendingReconnect, Effect::OpenTransport]
        );
    }

    #[test]
    fn closed_ignores_stale_transport_events() {
        for event in [
            E::ConnectFailed,
            E::TransportOpened,
            E::TransportClosed { code: 1006 },
            E::TransportError,
            E::RetryFired,
        ] {
            let (state, effects) = transition(S::Closed, event);
            assert_eq!(state, S::Closed);
            assert!(effects.is_empty(), "event {event:?} must be ignored");
        }
    }
}
