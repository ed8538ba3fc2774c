//! Cooldown gates and the unneeded-node grace timer
//!
//! Each flag is owned by the control loop and shared with at most one
//! deferred task that flips it after a delay. Every write bumps a
//! generation counter under the same lock, so a timer that was replaced or
//! cancelled can never overwrite newer state even if it was already running.

use crate::settings::ScalingSettings;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug)]
struct FlagState {
    value: bool,
    generation: u64,
}

/// Boolean flag that can be set immediately or after a delay
#[derive(Debug)]
pub struct DeferredFlag {
    name: &'static str,
    state: Arc<Mutex<FlagState>>,
    pending: Option<JoinHandle<()>>,
}

impl DeferredFlag {
    pub fn new(name: &'static str, initial: bool) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(FlagState {
                value: initial,
                generation: 0,
            })),
            pending: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlagState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value
    pub fn get(&self) -> bool {
        self.lock().value
    }

    /// Set the value now, dropping any pending deferred write
    pub fn set(&mut self, value: bool) {
        self.abort_pending();
        let mut state = self.lock();
        state.generation += 1;
        state.value = value;
    }

    /// Read and clear the flag in one step
    pub fn take(&mut self) -> bool {
        let mut state = self.lock();
        let value = state.value;
        if value {
            state.generation += 1;
            state.value = false;
        }
        value
    }

    /// Replace any pending write with one that sets `value` after `delay`
    pub fn set_after(&mut self, delay: Duration, value: bool) {
        self.abort_pending();
        let generation = {
            let mut state = self.lock();
            state.generation += 1;
            state.generation
        };

        let state = Arc::clone(&self.state);
        let name = self.name;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.generation == generation {
                state.value = value;
                info!(event = "deferred_flag_fired", flag = name, value, "Timeout done");
            } else {
                debug!(flag = name, "Superseded timer fired, ignoring");
            }
        }));
    }

    /// Drop any pending deferred write, keeping the current value
    pub fn cancel(&mut self) {
        self.abort_pending();
        self.lock().generation += 1;
    }

    /// True while a deferred write is outstanding
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn abort_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for DeferredFlag {
    fn drop(&mut self) {
        self.abort_pending();
    }
}

/// Delays applied after scale events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownDelays {
    pub scale_up_after_add: Duration,
    pub scale_down_after_add: Duration,
    pub scale_down: Duration,
    pub scale_down_after_error: Duration,
}

impl From<&ScalingSettings> for CooldownDelays {
    fn from(settings: &ScalingSettings) -> Self {
        Self {
            scale_up_after_add: Duration::from_secs(settings.scale_up_delay_after_add_secs),
            scale_down_after_add: Duration::from_secs(settings.scale_down_delay_after_add_secs),
            scale_down: Duration::from_secs(settings.scale_down_delay_secs),
            scale_down_after_error: Duration::from_secs(settings.scale_down_delay_after_error_secs),
        }
    }
}

/// The `can_scale_up` / `can_scale_down` gates
#[derive(Debug)]
pub struct CooldownScheduler {
    scale_up: DeferredFlag,
    scale_down: DeferredFlag,
    delays: CooldownDelays,
}

impl CooldownScheduler {
    pub fn new(delays: CooldownDelays) -> Self {
        Self {
            scale_up: DeferredFlag::new("can_scale_up", true),
            scale_down: DeferredFlag::new("can_scale_down", true),
            delays,
        }
    }

    pub fn delays(&self) -> CooldownDelays {
        self.delays
    }

    pub fn can_scale_up(&self) -> bool {
        self.scale_up.get()
    }

    pub fn can_scale_down(&self) -> bool {
        self.scale_down.get()
    }

    /// Close both gates before a scale-up starts
    pub fn begin_scale_up(&mut self) {
        self.scale_up.set(false);
        self.scale_down.set(false);
    }

    /// Reopen both gates after their post-add delays, whatever the outcome
    pub fn finish_scale_up(&mut self) {
        self.scale_up.set_after(self.delays.scale_up_after_add, true);
        self.scale_down.set_after(self.delays.scale_down_after_add, true);
    }

    /// Close the scale-down gate after a successful removal and arm its reopening
    pub fn finish_scale_down(&mut self) {
        self.scale_down.set(false);
        self.scale_down.set_after(self.delays.scale_down, true);
    }

    /// How long the control loop blocks after a failed removal
    pub fn scale_down_error_pause(&self) -> Duration {
        self.delays.scale_down_after_error
    }
}

/// Tracks whether the current removal candidate stayed unneeded long enough
#[derive(Debug)]
pub struct UnneededNodeTimer {
    elapsed: DeferredFlag,
    delay: Duration,
}

impl UnneededNodeTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            elapsed: DeferredFlag::new("unneeded_node_elapsed", false),
            delay,
        }
    }

    pub fn is_running(&self) -> bool {
        self.elapsed.is_pending()
    }

    /// Start the grace period unless one is already running
    pub fn start_if_idle(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        self.elapsed.set_after(self.delay, true);
        true
    }

    /// Stop the grace period and forget any confirmation not yet consumed
    pub fn cancel(&mut self) {
        self.elapsed.set(false);
    }

    /// Consume the single-shot confirmation
    pub fn take_elapsed(&mut self) -> bool {
        self.elapsed.take()
    }
}
