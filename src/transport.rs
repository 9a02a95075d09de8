//! Interfaces to the byte transport and the reactor, and the timer bookkeeping built on
//! top of them.
use std::{fmt, time::Duration};

use bytes::Bytes;

/// The duplex byte stream under a connection.
///
/// Writes never block: the transport buffers what it cannot send right away.
/// Once `close` or `abort` was called, the driver reports the end of the transport
/// through [`WebSocketEngine::connection_lost`](crate::WebSocketEngine::connection_lost).
pub trait Transport: Send {
    fn write(&mut self, data: Bytes);

    /// Closes after every buffered write was flushed.
    fn close(&mut self);

    /// Closes immediately, discarding buffered writes.
    fn abort(&mut self);

    /// Peer address, for logging.
    fn remote_address(&self) -> Option<String> {
        None
    }

    fn set_no_delay(&mut self, _enabled: bool) {}
}

/// A scheduled timer. Dropping the handle does not cancel it.
pub trait TimerHandle: Send {
    fn cancel(&mut self);
}

/// Schedules timers on the event loop driving the connection.
///
/// When a timer expires the reactor hands its token back through
/// [`WebSocketEngine::timer_fired`](crate::WebSocketEngine::timer_fired).
pub trait Reactor: Send {
    fn call_later(&mut self, delay: Duration, token: TimerToken) -> Box<dyn TimerHandle>;
}

/// What a timer is for. A connection holds at most one timer of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    OpenHandshake,
    CloseHandshake,
    ServerConnectionDrop,
    AutoPing,
    AutoPingTimeout,
    SendQueue,
}

impl TimerKind {
    const ALL: [TimerKind; 6] = [
        TimerKind::OpenHandshake,
        TimerKind::CloseHandshake,
        TimerKind::ServerConnectionDrop,
        TimerKind::AutoPing,
        TimerKind::AutoPingTimeout,
        TimerKind::SendQueue,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Identifies one arming of a timer. A token whose generation is not current is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

struct ArmedTimer {
    generation: u64,
    handle: Box<dyn TimerHandle>,
}

/// The timers of a connection, one slot per [`TimerKind`].
#[derive(Default)]
pub struct Timers {
    slots: [Option<ArmedTimer>; 6],
    generation: u64,
}

impl fmt::Debug for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                TimerKind::ALL
                    .iter()
                    .filter(|kind| self.is_armed(**kind)),
            )
            .finish()
    }
}

impl Timers {
    /// Arms a timer, cancelling the previous one of the same kind.
    pub fn arm(&mut self, reactor: &mut dyn Reactor, kind: TimerKind, delay: Duration) {
        self.cancel(kind);
        self.generation += 1;
        let token = TimerToken {
            kind,
            generation: self.generation,
        };
        let handle = reactor.call_later(delay, token);
        self.slots[kind.index()] = Some(ArmedTimer {
            generation: self.generation,
            handle,
        });
    }

    /// Cancels a timer. Cancelling a timer that is not armed does nothing.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(mut timer) = self.slots[kind.index()].take() {
            timer.handle.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for kind in TimerKind::ALL {
            self.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    /// Consumes a fired token. Returns `false` for stale or cancelled timers.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        let slot = &mut self.slots[token.kind.index()];
        match slot {
            Some(timer) if timer.generation == token.generation => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}
