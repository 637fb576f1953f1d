//! Provider block circuit.
//!
//! # States
//! - Closed: API used for every address
//! - Open: provider is blocking us, addresses go straight to the fallback
//! - Half-Open: one probe address is sent to the API
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_threshold consecutive blocked addresses
//! Open → Half-Open: after cooldown
//! Half-Open → Closed: probe gets a non-blocked answer
//! Half-Open → Open: probe is blocked again
//! Half-Open → Half-Open: probe abandoned (cancelled or dropped), next address probes
//! ```

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_blocks: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct BlockCircuit {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl BlockCircuit {
    pub fn new(config: &CircuitConfig) -> Self {
        Self {
            threshold: config.failure_threshold,
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_blocks: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Should the next address try the API?
    ///
    /// The returned pass must be settled with `success` or `block`. A pass
    /// dropped unsettled gives a half-open probe slot back.
    pub fn allow_api(&self) -> Option<ApiPass<'_>> {
        if self.threshold == 0 {
            return Some(ApiPass::new(self, false));
        }
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(ApiPass::new(self, false)),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                tracing::info!("Provider circuit half-open, probing API");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                Some(ApiPass::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(ApiPass::new(self, true))
                }
            }
        }
    }

    /// Free the probe slot without deciding the state.
    fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            tracing::debug!("Circuit probe abandoned");
            inner.probe_in_flight = false;
        }
    }

    /// The API answered without blocking us.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("Provider circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_blocks = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// An address was confirmed blocked at the provider level.
    pub fn record_block(&self) {
        if self.threshold == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.consecutive_blocks = inner.consecutive_blocks.saturating_add(1);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_blocks >= self.threshold,
            CircuitState::Open => false,
        };
        if trip {
            tracing::warn!(
                consecutive_blocks = inner.consecutive_blocks,
                cooldown_secs = self.cooldown.as_secs(),
                "Provider circuit opened, routing addresses to fallback"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        }
    }
}

/// Permission for one address to use the API.
#[must_use = "an unsettled pass is treated as an abandoned probe"]
#[derive(Debug)]
pub struct ApiPass<'a> {
    circuit: &'a BlockCircuit,
    probe: bool,
    settled: bool,
}

impl<'a> ApiPass<'a> {
    fn new(circuit: &'a BlockCircuit, probe: bool) -> Self {
        Self {
            circuit,
            probe,
            settled: false,
        }
    }

    /// Whether this pass is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The API answered without blocking us.
    pub fn success(mut self) {
        self.settled = true;
        self.circuit.record_success();
    }

    /// The API blocked this address.
    pub fn block(mut self) {
        self.settled = true;
        self.circuit.record_block();
    }
}

impl Drop for ApiPass<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.circuit.abandon_probe();
        }
    }
}
