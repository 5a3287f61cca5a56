//! Stream connection supervisor.
//!
//! A pure state machine: events in, directives out. The session loop owns
//! the actual timers and connections and executes whatever directives come
//! back, which keeps every transition testable without I/O.

use std::time::Duration;

use tracing::{debug, info, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);
pub const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    /// Live connection lost; fallback polling covers the gap while
    /// reconnect attempts run on backoff.
    Degraded,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Caller wants the stream up (initial start or post-reset restart).
    StartRequested,
    /// First successfully parsed event on the pending connection. A
    /// connection is only trusted once it has actually delivered something.
    FirstEventParsed,
    OpenFailed { detail: String },
    /// The connection dropped or the server closed it, whether or not it
    /// ever delivered an event.
    ConnectionLost { detail: String },
    ReconnectTimerFired,
    /// Caller is done with the stream for good.
    CloseRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    OpenStream,
    StartFallbackPolling,
    StopFallbackPolling,
    ScheduleReconnect { after: Duration },
    ReleaseConnection,
}

#[derive(Debug)]
pub struct StreamSupervisor {
    state: StreamState,
    backoff: Duration,
}

impl Default for StreamSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSupervisor {
    pub fn new() -> Self {
        Self {
            state: StreamState::Disconnected,
            backoff: INITIAL_BACKOFF,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == StreamState::Connected
    }

    /// Feed one event through the machine. Directives must be executed in
    /// the order returned.
    pub fn handle(&mut self, event: StreamEvent) -> Vec<Directive> {
        if self.state == StreamState::Closed {
            // Closed is terminal; a new supervisor is built for a new
            // subscription.
            return Vec::new();
        }

        match event {
            StreamEvent::StartRequested => match self.state {
                StreamState::Disconnected => {
                    self.state = StreamState::Connecting;
                    vec![Directive::OpenStream]
                }
                _ => Vec::new(),
            },
            StreamEvent::FirstEventParsed => match self.state {
                StreamState::Connecting => {
                    info!("lifecycle stream connected");
                    self.state = StreamState::Connected;
                    self.backoff = INITIAL_BACKOFF;
                    vec![Directive::StopFallbackPolling]
                }
                _ => Vec::new(),
            },
            StreamEvent::OpenFailed { detail } => match self.state {
                StreamState::Connecting => {
                    warn!(detail = %detail, "lifecycle stream open failed");
                    let after = self.next_backoff();
                    self.state = StreamState::Degraded;
                    vec![
                        Directive::StartFallbackPolling,
                        Directive::ScheduleReconnect { after },
                    ]
                }
                _ => Vec::new(),
            },
            StreamEvent::ConnectionLost { detail } => match self.state {
                StreamState::Connected | StreamState::Connecting => {
                    warn!(detail = %detail, "lifecycle stream lost, degrading to polling");
                    let after = self.next_backoff();
                    self.state = StreamState::Degraded;
                    vec![
                        Directive::ReleaseConnection,
                        Directive::StartFallbackPolling,
                        Directive::ScheduleReconnect { after },
                    ]
                }
                _ => Vec::new(),
            },
            StreamEvent::ReconnectTimerFired => match self.state {
                StreamState::Degraded => {
                    debug!("reconnect timer fired, reopening stream");
                    self.state = StreamState::Connecting;
                    vec![Directive::OpenStream]
                }
                _ => Vec::new(),
            },
            StreamEvent::CloseRequested => {
                let mut directives = Vec::new();
                match self.state {
                    StreamState::Connected | StreamState::Connecting => {
                        directives.push(Directive::ReleaseConnection);
                    }
                    StreamState::Degraded => {
                        directives.push(Directive::StopFallbackPolling);
                    }
                    StreamState::Disconnected | StreamState::Closed => {}
                }
                self.state = StreamState::Closed;
                directives
            }
        }
    }

    fn next_backoff(&mut self) -> Duration {
        let current = self.backoff;
        let next = current + current;
        self.backoff = if next > MAX_BACKOFF { MAX_BACKOFF } else { next };
        current
    }
}
