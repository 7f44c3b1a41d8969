//! Callback-threading policy.
//!
//! Every hook, and the per-connection receive dispatch, has its own slot
//! saying where it runs: inline on the engine thread that triggered it, on a
//! freshly spawned thread, or on the server's bounded worker pool.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use serde::Deserialize;

/// Where a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Execution {
    /// On the thread that produced the event.
    #[default]
    Inline = 0,
    /// On a new transient thread per invocation.
    Thread = 1,
    /// On the server's worker pool.
    Pool = 2,
}

impl Execution {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Execution::Thread,
            2 => Execution::Pool,
            _ => Execution::Inline,
        }
    }
}

impl From<bool> for Execution {
    fn from(run_on_thread: bool) -> Self {
        if run_on_thread {
            Execution::Thread
        } else {
            Execution::Inline
        }
    }
}

const SLOTS: usize = 8;

/// The policy slots: seven hooks plus the receive dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Callback {
    OnStart,
    OnStop,
    OnReceive,
    OnConnect,
    OnDisconnect,
    OnAbnormalDisconnect,
    OnWarning,
    ReceiveDispatch,
}

impl Callback {
    pub const ALL: [Callback; SLOTS] = [
        Callback::OnStart,
        Callback::OnStop,
        Callback::OnReceive,
        Callback::OnConnect,
        Callback::OnDisconnect,
        Callback::OnAbnormalDisconnect,
        Callback::OnWarning,
        Callback::ReceiveDispatch,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Callback::OnStart => "on_start",
            Callback::OnStop => "on_stop",
            Callback::OnReceive => "on_receive",
            Callback::OnConnect => "on_connect",
            Callback::OnDisconnect => "on_disconnect",
            Callback::OnAbnormalDisconnect => "on_abnormal_disconnect",
            Callback::OnWarning => "on_warning",
            Callback::ReceiveDispatch => "receive_dispatch",
        }
    }
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which slots a policy update applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTarget {
    All,
    Only(Callback),
}

impl From<Callback> for PolicyTarget {
    fn from(callback: Callback) -> Self {
        PolicyTarget::Only(callback)
    }
}

/// Lock-free table mapping each [`Callback`] to its [`Execution`].
pub struct ThreadingPolicy {
    slots: [AtomicU8; SLOTS],
}

impl ThreadingPolicy {
    pub fn new(hooks: Execution, receive_dispatch: Execution) -> Self {
        let slots = Callback::ALL.map(|callback| match callback {
            Callback::ReceiveDispatch => AtomicU8::new(receive_dispatch as u8),
            _ => AtomicU8::new(hooks as u8),
        });
        Self { slots }
    }

    pub fn get(&self, callback: Callback) -> Execution {
        Execution::from_u8(self.slots[callback.slot()].load(Ordering::Acquire))
    }

    pub fn set(&self, target: PolicyTarget, execution: Execution) {
        match target {
            PolicyTarget::All => {
                for slot in &self.slots {
                    slot.store(execution as u8, Ordering::Release);
                }
            }
            PolicyTarget::Only(callback) => {
                self.slots[callback.slot()].store(execution as u8, Ordering::Release)
            }
        }
    }
}

impl Default for ThreadingPolicy {
    fn default() -> Self {
        Self::new(Execution::Inline, Execution::Thread)
    }
}

impl fmt::Debug for ThreadingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for callback in Callback::ALL {
            map.entry(&callback.name(), &self.get(callback));
        }
        map.finish()
    }
}
