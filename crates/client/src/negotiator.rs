//! Transport negotiation state machine
//!
//! `transition(state, input, now, config) -> (state, effects)` is pure: no
//! IO, no timers, no async. The client event loop feeds it transport and
//! timer inputs and carries out the returned effects.
//!
//! Order of preference is WebSocket, then SSE, then polling. Degradation is
//! one-way: once a transport is abandoned it is never tried again for the
//! session, and polling is terminal.

use std::time::{Duration, Instant};

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    WebSocket,
    Sse,
    Polling,
}

impl Transport {
    /// Next transport to fall through to.
    pub fn fallback(self) -> Transport {
        match self {
            Transport::WebSocket => Transport::Sse,
            Transport::Sse | Transport::Polling => Transport::Polling,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::WebSocket => "websocket",
            Transport::Sse => "sse",
            Transport::Polling => "polling",
        }
    }
}

/// Connection state reported to the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting(Transport),
    Connected(Transport),
    Reconnecting { transport: Transport, retry: u32 },
    /// Polling exhausted its failure budget.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    None,
    /// Waiting for `transport` to open. `retries` counts reconnects of the
    /// same transport.
    Connecting {
        transport: Transport,
        attempt: u64,
        retries: u32,
    },
    Open {
        transport: Transport,
        attempt: u64,
        since: Instant,
        retries: u32,
    },
    /// Backing off before reconnecting `transport`.
    Backoff {
        transport: Transport,
        attempt: u64,
        retries: u32,
    },
    Polling,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorState {
    pub phase: Phase,
    /// Richest transport still allowed for this session.
    pub floor: Transport,
    /// Serial number of the latest transport attempt. Timer and transport
    /// inputs carrying an older number are stale and ignored.
    pub attempt: u64,
}

impl Default for NegotiatorState {
    fn default() -> Self {
        Self {
            phase: Phase::None,
            floor: Transport::WebSocket,
            attempt: 0,
        }
    }
}

impl NegotiatorState {
    /// Transport currently opening or open, if any.
    pub fn push_transport(&self) -> Option<(Transport, u64)> {
        match self.phase {
            Phase::Connecting {
                transport, attempt, ..
            }
            | Phase::Open {
                transport, attempt, ..
            } => Some((transport, attempt)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    Opened { transport: Transport, attempt: u64 },
    Closed { transport: Transport, attempt: u64 },
    Failed { transport: Transport, attempt: u64 },
    ConnectTimeout { attempt: u64 },
    ReconnectDue { attempt: u64 },
    PollingExhausted,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Open { transport: Transport, attempt: u64 },
    Close(Transport),
    ArmConnectTimeout { attempt: u64, after: Duration },
    ScheduleReconnect { attempt: u64, delay: Duration },
    CancelTimers,
    StartPolling,
    StopPolling,
    Emit(ConnectionStatus),
}

/// Exponential reconnect delay: base, 2x base, 4x base ... capped.
pub fn reconnect_delay(config: &ClientConfig, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    config
        .reconnect_base_delay
        .checked_mul(factor)
        .unwrap_or(config.reconnect_max_delay)
        .min(config.reconnect_max_delay)
}

pub fn transition(
    mut state: NegotiatorState,
    input: Input,
    now: Instant,
    config: &ClientConfig,
) -> (NegotiatorState, Vec<Effect>) {
    let mut effects = Vec::new();

    match (state.phase.clone(), input) {
        // -- Start ----------------------------------------------------------
        (Phase::None, Input::Start) => {
            let floor = state.floor;
            begin(&mut state, floor, 0, config, &mut effects);
        }

        // -- Opening --------------------------------------------------------
        (
            Phase::Connecting {
                transport,
                attempt,
                retries,
            },
            Input::Opened {
                transport: t,
                attempt: a,
            },
        ) if t == transport && a == attempt => {
            state.phase = Phase::Open {
                transport,
                attempt,
                since: now,
                retries,
            };
            effects.push(Effect::CancelTimers);
            effects.push(Effect::Emit(ConnectionStatus::Connected(transport)));
        }

        (
            Phase::Connecting {
                transport,
                attempt,
                retries,
            },
            Input::Failed {
                transport: t,
                attempt: a,
            }
            | Input::Closed {
                transport: t,
                attempt: a,
            },
        ) if t == transport && a == attempt => {
            effects.push(Effect::CancelTimers);
            if retries == 0 {
                // Never opened: structural, not a blip.
                fall_through(&mut state, transport, config, &mut effects);
            } else {
                retry_or_fall_through(&mut state, transport, retries, config, &mut effects);
            }
        }

        (
            Phase::Connecting {
                transport,
                attempt,
                retries,
            },
            Input::ConnectTimeout { attempt: a },
        ) if a == attempt => {
            effects.push(Effect::Close(transport));
            if retries == 0 {
                fall_through(&mut state, transport, config, &mut effects);
            } else {
                retry_or_fall_through(&mut state, transport, retries, config, &mut effects);
            }
        }

        // -- Established ----------------------------------------------------
        (
            Phase::Open {
                transport,
                attempt,
                since,
                ..
            },
            Input::Failed {
                transport: t,
                attempt: a,
            }
            | Input::Closed {
                transport: t,
                attempt: a,
            },
        ) if t == transport && a == attempt => {
            let lived = now.saturating_duration_since(since);
            if lived < config.quick_failure_window {
                fall_through(&mut state, transport, config, &mut effects);
            } else {
                // A stable connection earns a fresh reconnect budget.
                retry_or_fall_through(&mut state, transport, 0, config, &mut effects);
            }
        }

        // -- Backoff --------------------------------------------------------
        (
            Phase::Backoff {
                transport,
                attempt,
                retries,
            },
            Input::ReconnectDue { attempt: a },
        ) if a == attempt => {
            state.phase = Phase::Connecting {
                transport,
                attempt,
                retries,
            };
            effects.push(Effect::Emit(ConnectionStatus::Reconnecting {
                transport,
                retry: retries,
            }));
            effects.push(Effect::Open { transport, attempt });
            effects.push(Effect::ArmConnectTimeout {
                attempt,
                after: config.connect_timeout,
            });
        }

        // -- Polling --------------------------------------------------------
        (Phase::Polling, Input::PollingExhausted) => {
            state.phase = Phase::Unavailable;
            effects.push(Effect::StopPolling);
            effects.push(Effect::Emit(ConnectionStatus::Unavailable));
        }

        // -- Disconnect -----------------------------------------------------
        (Phase::None, Input::Disconnect) => {}
        (phase, Input::Disconnect) => {
            effects.push(Effect::CancelTimers);
            match phase {
                Phase::Connecting { transport, .. } | Phase::Open { transport, .. } => {
                    effects.push(Effect::Close(transport));
                }
                Phase::Polling => effects.push(Effect::StopPolling),
                _ => {}
            }
            state.phase = Phase::None;
            effects.push(Effect::Emit(ConnectionStatus::Disconnected));
        }

        // Stale timers, late events from abandoned transports, Start while
        // running: nothing to do.
        _ => {}
    }

    (state, effects)
}

/// Open `transport` as a new attempt (or enter polling).
fn begin(
    state: &mut NegotiatorState,
    transport: Transport,
    retries: u32,
    config: &ClientConfig,
    effects: &mut Vec<Effect>,
) {
    if transport == Transport::Polling {
        state.phase = Phase::Polling;
        effects.push(Effect::StartPolling);
        effects.push(Effect::Emit(ConnectionStatus::Connected(Transport::Polling)));
        return;
    }

    state.attempt += 1;
    let attempt = state.attempt;
    state.phase = Phase::Connecting {
        transport,
        attempt,
        retries,
    };
    effects.push(Effect::Emit(ConnectionStatus::Connecting(transport)));
    effects.push(Effect::Open { transport, attempt });
    effects.push(Effect::ArmConnectTimeout {
        attempt,
        after: config.connect_timeout,
    });
}

fn fall_through(
    state: &mut NegotiatorState,
    from: Transport,
    config: &ClientConfig,
    effects: &mut Vec<Effect>,
) {
    let next = from.fallback();
    state.floor = next;
    begin(state, next, 0, config, effects);
}

fn retry_or_fall_through(
    state: &mut NegotiatorState,
    transport: Transport,
    retries: u32,
    config: &ClientConfig,
    effects: &mut Vec<Effect>,
) {
    if retries >= config.max_reconnect_attempts {
        fall_through(state, transport, config, effects);
        return;
    }

    state.attempt += 1;
    let attempt = state.attempt;
    let retry = retries + 1;
    state.phase = Phase::Backoff {
        transport,
        attempt,
        retries: retry,
    };
    effects.push(Effect::ScheduleReconnect {
        attempt,
        delay: reconnect_delay(config, retries),
    });
    effects.push(Effect::Emit(ConnectionStatus::Reconnecting { transport, retry }));
}
