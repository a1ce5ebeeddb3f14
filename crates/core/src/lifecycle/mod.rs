use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::bridge::ConsumerBinding;
use crate::error::{BridgeError, Result};

/// Installation state of the consumer binding.
///
/// `Reset` is still installed: the binding remains registered but reports the
/// empty frame until the next write lands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    Uninstalled = 0,
    Installing = 1,
    Installed = 2,
    Reset = 3,
}

impl From<u8> for BridgeState {
    fn from(value: u8) -> Self {
        match value {
            1 => BridgeState::Installing,
            2 => BridgeState::Installed,
            3 => BridgeState::Reset,
            _ => BridgeState::Uninstalled,
        }
    }
}

/// Atomic state machine driving installation, reset, and teardown.
///
/// Every transition is a compare-and-swap, so concurrent install attempts,
/// resets, and writes race safely and exactly one caller wins each edge.
#[derive(Debug)]
pub struct LifecycleController {
    state: AtomicU8,
    resets: AtomicU64,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(BridgeState::Uninstalled as u8),
            resets: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from(self.state.load(Ordering::Acquire))
    }

    /// Explicit resets observed so far.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Claims the `Uninstalled -> Installing` edge for one install attempt.
    pub fn begin_install(&self) -> Result<()> {
        match self.state.compare_exchange(
            BridgeState::Uninstalled as u8,
            BridgeState::Installing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => match BridgeState::from(current) {
                BridgeState::Installing => Err(BridgeError::AlreadyInstalling),
                _ => Err(BridgeError::AlreadyInstalled),
            },
        }
    }

    /// Finishes a successful install. Returns false when the bridge was torn
    /// down while the handshake was in flight.
    pub fn complete_install(&self) -> bool {
        self.state
            .compare_exchange(
                BridgeState::Installing as u8,
                BridgeState::Installed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Abandons an install attempt so a later one may retry.
    pub fn fail_install(&self) {
        let _ = self.state.compare_exchange(
            BridgeState::Installing as u8,
            BridgeState::Uninstalled as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Moves an installed bridge into the reset sub-state. Returns false when
    /// nothing is installed, in which case the reset is a no-op.
    pub fn mark_reset(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            match BridgeState::from(current) {
                BridgeState::Installed | BridgeState::Reset => {
                    if self
                        .state
                        .compare_exchange_weak(
                            current,
                            BridgeState::Reset as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.resets.fetch_add(1, Ordering::Relaxed);
                        return true;
                    }
                }
                _ => return false,
            }
        }
    }

    /// A successful write ends the reset sub-state.
    pub fn note_write(&self) {
        let _ = self.state.compare_exchange(
            BridgeState::Reset as u8,
            BridgeState::Installed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Unconditionally returns to `Uninstalled`, reporting the prior state.
    pub fn tear_down(&self) -> BridgeState {
        BridgeState::from(
            self.state
                .swap(BridgeState::Uninstalled as u8, Ordering::AcqRel),
        )
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Executor for the consumer's execution context.
///
/// The bridge never registers the binding itself: it hands an
/// [`InstallRequest`] to the host, which must run it on the thread or task
/// where the consumer will later poll frames and then resolve or reject it
/// there.
pub trait BindingHost: Send + Sync {
    fn schedule(&self, request: InstallRequest);
}

type InstallReply = Result<()>;

/// Builds a handle that reports `err` without any host involvement, for
/// install attempts rejected before they reach the host.
pub(crate) fn rejected_handle(err: BridgeError) -> InstallHandle {
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = reply_tx.send(Err(err));
    InstallHandle { reply: reply_rx }
}

pub(crate) fn handshake(
    binding: ConsumerBinding,
    lifecycle: Arc<LifecycleController>,
    parked: Arc<Mutex<Option<ConsumerBinding>>>,
) -> (InstallRequest, InstallHandle) {
    let (reply_tx, reply_rx) = oneshot::channel();
    (
        InstallRequest {
            binding: Some(binding),
            reply: Some(reply_tx),
            lifecycle,
            parked,
        },
        InstallHandle { reply: reply_rx },
    )
}

/// One in-flight install attempt, carrying the consumer binding to the host.
///
/// The host decides it exactly once: [`resolve`](Self::resolve) hands the
/// binding out for registration, [`reject`](Self::reject) parks it again so a
/// later attempt can retry. Dropping the request undecided counts as a
/// rejection with a generic cause.
pub struct InstallRequest {
    binding: Option<ConsumerBinding>,
    reply: Option<oneshot::Sender<InstallReply>>,
    lifecycle: Arc<LifecycleController>,
    parked: Arc<Mutex<Option<ConsumerBinding>>>,
}

impl InstallRequest {
    /// Completes the handshake on the consumer context and yields the binding.
    ///
    /// Fails when the bridge was torn down while the request was queued; the
    /// binding is then parked again rather than handed out.
    pub fn resolve(mut self) -> Result<ConsumerBinding> {
        let binding = self
            .binding
            .take()
            .expect("binding is present until the request is decided");
        if self.lifecycle.complete_install() {
            self.send(Ok(()));
            Ok(binding)
        } else {
            self.park(binding);
            let cause = "bridge torn down during installation";
            self.send(Err(BridgeError::registration(cause)));
            Err(BridgeError::registration(cause))
        }
    }

    /// Declines the handshake, keeping the binding available for a retry.
    pub fn reject<T: Into<String>>(mut self, cause: T) {
        let binding = self
            .binding
            .take()
            .expect("binding is present until the request is decided");
        self.park(binding);
        self.lifecycle.fail_install();
        self.send(Err(BridgeError::registration(cause)));
    }

    fn park(&self, binding: ConsumerBinding) {
        if let Ok(mut slot) = self.parked.lock() {
            *slot = Some(binding);
        }
    }

    fn send(&mut self, reply: InstallReply) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(reply);
        }
    }
}

impl Drop for InstallRequest {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            self.park(binding);
            self.lifecycle.fail_install();
            self.send(Err(BridgeError::registration(
                "install request dropped without a decision",
            )));
        }
    }
}

impl std::fmt::Debug for InstallRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallRequest")
            .field("decided", &self.binding.is_none())
            .finish()
    }
}

fn reply_to_result(
    reply: std::result::Result<InstallReply, oneshot::error::RecvError>,
) -> Result<()> {
    match reply {
        Ok(decision) => decision,
        Err(_) => Err(BridgeError::registration(
            "install request dropped without a decision",
        )),
    }
}

/// Caller's view of an in-flight install attempt.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain
/// thread. Either way it yields once the host has decided the request.
#[derive(Debug)]
pub struct InstallHandle {
    reply: oneshot::Receiver<InstallReply>,
}

impl InstallHandle {
    /// Blocks the calling thread until the host decides the request. Must not
    /// be called from an async context; await the handle there instead.
    pub fn wait(self) -> Result<()> {
        reply_to_result(self.reply.blocking_recv())
    }
}

impl Future for InstallHandle {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().reply)
            .poll(cx)
            .map(reply_to_result)
    }
}
