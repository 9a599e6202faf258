//! Shared bridging discipline (§4.3.4): the per-connection pump between a
//! local socket and an overlay endpoint.
//!
//! The source material arranges cleanup through callback-event handlers that
//! read and mutate shared flags, a pattern that invites the duplicate-cleanup
//! bug where a flag set inside one closure never reaches the helper that
//! needs it. This replaces that with a single explicit `BridgeState` owned by
//! one `Bridge` value: `bridge_duplex` transitions it through `note_local_end`
//! / `note_remote_end` and reads it back via `state()` to decide whether a
//! half-close ends the pump or only one direction of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::BridgeError;

/// A Bridge's lifecycle. `Open` allows independent half-closes in either
/// direction; `Destroyed` is terminal and reached from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Destroyed,
}

/// Every live Bridge registers a weak handle here so an external shutdown
/// (signal) can reach it (spec.md §5: "triggers graceful `end()` on every
/// live Bridge"). Weak so a bridge's own drop is never held up by this list.
static REGISTRY: Lazy<Mutex<Vec<Weak<Bridge>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// The write-once destroy latch plus the directional half-close state,
/// shared (via `Arc`) between the two pump tasks of one connection.
pub struct Bridge {
    name: String,
    destroyed: AtomicBool,
    state: std::sync::Mutex<BridgeState>,
    shutdown: Notify,
}

impl Bridge {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let bridge = Arc::new(Self {
            name: name.into(),
            destroyed: AtomicBool::new(false),
            state: std::sync::Mutex::new(BridgeState::Open),
            shutdown: Notify::new(),
        });
        REGISTRY.lock().expect("bridge registry mutex poisoned").push(Arc::downgrade(&bridge));
        bridge
    }

    /// Wait for an external shutdown request (see [`shutdown_all`]). Pump
    /// loops select on this alongside their normal I/O so a process-wide
    /// shutdown can close every Bridge's local/remote sides gracefully
    /// rather than relying on the process simply exiting.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// A natural half-close arrived from the local side: local has nothing
    /// more to write to remote, but remote may still have bytes in flight.
    pub fn note_local_end(&self) {
        let mut state = self.state.lock().expect("bridge state mutex poisoned");
        *state = match *state {
            BridgeState::Open => BridgeState::HalfClosedLocal,
            BridgeState::HalfClosedRemote => BridgeState::Destroyed,
            other => other,
        };
    }

    /// A natural half-close arrived from the remote side.
    pub fn note_remote_end(&self) {
        let mut state = self.state.lock().expect("bridge state mutex poisoned");
        *state = match *state {
            BridgeState::Open => BridgeState::HalfClosedRemote,
            BridgeState::HalfClosedLocal => BridgeState::Destroyed,
            other => other,
        };
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().expect("bridge state mutex poisoned")
    }

    /// Write-once destroy latch. Returns `true` the first time it is called
    /// (the caller is then responsible for running the actual teardown);
    /// every subsequent call is a harmless no-op, satisfying the "cleanup is
    /// idempotent" invariant.
    pub fn mark_destroyed(&self) -> bool {
        let first = self
            .destroyed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            *self.state.lock().expect("bridge state mutex poisoned") = BridgeState::Destroyed;
            info!(bridge = %self.name, "bridge destroyed");
        }
        first
    }

    /// Record a mid-connection failure. Takes anything convertible into a
    /// [`BridgeError`] (an `io::Error` from a read/write, or an explicit
    /// variant like `BridgeError::Timeout`) so every reason given to it is a
    /// real member of the non-fatal error taxonomy rather than an ad hoc
    /// string.
    pub fn note_error(&self, reason: impl Into<BridgeError>) {
        let reason = reason.into();
        warn!(bridge = %self.name, error = %reason, "bridge error");
    }
}

const PUMP_CHUNK: usize = 16 * 1024;

/// The TCP and TCP-over-datagram bridging loop: two independent directions,
/// each able to half-close without disturbing the other, driven from one
/// task so no cross-task cancellation signalling is needed. A write failure
/// or idle timeout on either side destroys the whole bridge exactly once.
///
/// `allow_half_open` distinguishes the TCP engine (half-open sockets
/// allowed, per §4.3.4) from TCP-over-datagram (datagram channels have no
/// half-close, so a natural end on either side destroys the bridge too).
pub async fn bridge_duplex<R1, W1, R2, W2>(
    bridge: Arc<Bridge>,
    mut local_r: R1,
    mut local_w: W1,
    mut remote_r: R2,
    mut remote_w: W2,
    idle_timeout: Duration,
    allow_half_open: bool,
) where
    R1: AsyncRead + Unpin,
    W1: AsyncWrite + Unpin,
    R2: AsyncRead + Unpin,
    W2: AsyncWrite + Unpin,
{
    let mut local_buf = vec![0u8; PUMP_CHUNK];
    let mut remote_buf = vec![0u8; PUMP_CHUNK];

    'pump: loop {
        // Re-read the state each iteration: it is the single source of
        // truth for which directions are still open, so the `select!` gates
        // below never drift from what `note_local_end`/`note_remote_end`
        // last recorded.
        let (local_open, remote_open) = match bridge.state() {
            BridgeState::Open => (true, true),
            BridgeState::HalfClosedLocal => (false, true),
            BridgeState::HalfClosedRemote => (true, false),
            BridgeState::Destroyed => break 'pump,
        };

        tokio::select! {
            res = local_r.read(&mut local_buf), if local_open => {
                match res {
                    Ok(0) => {
                        bridge.note_local_end();
                        let _ = remote_w.shutdown().await;
                        if !allow_half_open {
                            break 'pump;
                        }
                    }
                    Ok(n) => {
                        if let Err(e) = remote_w.write_all(&local_buf[..n]).await {
                            bridge.note_error(e);
                            break 'pump;
                        }
                    }
                    Err(e) => {
                        bridge.note_error(e);
                        break 'pump;
                    }
                }
            },
            res = remote_r.read(&mut remote_buf), if remote_open => {
                match res {
                    Ok(0) => {
                        bridge.note_remote_end();
                        let _ = local_w.shutdown().await;
                        if !allow_half_open {
                            break 'pump;
                        }
                    }
                    Ok(n) => {
                        if let Err(e) = local_w.write_all(&remote_buf[..n]).await {
                            bridge.note_error(e);
                            break 'pump;
                        }
                    }
                    Err(e) => {
                        bridge.note_error(e);
                        break 'pump;
                    }
                }
            },
            _ = tokio::time::sleep(idle_timeout) => {
                bridge.note_error(BridgeError::Timeout);
                break 'pump;
            }
            _ = bridge.shutdown_requested() => {
                info!(bridge = %bridge.name, "bridge shutting down on external request");
                bridge.note_local_end();
                bridge.note_remote_end();
                break 'pump;
            }
        }
    }

    bridge.mark_destroyed();
    let _ = local_w.shutdown().await;
    let _ = remote_w.shutdown().await;
}

/// Request a graceful close of every currently-live Bridge (spec.md §5:
/// external shutdown triggers `end()` on every live Bridge), then wait up to
/// `grace` for them to finish tearing themselves down. Bridges still alive
/// after `grace` are logged and left for the process exit to reclaim; the
/// engines have no separate `destroy()` path distinct from dropping their
/// sockets, so there is nothing further to forcibly close here.
pub async fn shutdown_all(grace: Duration) {
    let bridges: Vec<Arc<Bridge>> = {
        let mut reg = REGISTRY.lock().expect("bridge registry mutex poisoned");
        reg.retain(|w| w.strong_count() > 0);
        reg.iter().filter_map(Weak::upgrade).collect()
    };
    if bridges.is_empty() {
        return;
    }
    info!(count = bridges.len(), "requesting graceful shutdown of live bridges");
    for bridge in &bridges {
        bridge.request_shutdown();
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if bridges.iter().all(|b| b.is_destroyed()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            let stragglers = bridges.iter().filter(|b| !b.is_destroyed()).count();
            if stragglers > 0 {
                warn!(stragglers, "grace period elapsed with bridges still open");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
