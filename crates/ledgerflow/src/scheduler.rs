//! Timers that feed synthetic events back into flows: one-shot sleeps and
//! the timed-flow retry timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use time::OffsetDateTime;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::checkpoint::{FutureHandle, StateMachineState};
use crate::clock::Clock;
use crate::config::FlowTimeoutConfig;
use crate::error::{FlowError, FlowErrorKind};
use crate::event::Event;
use crate::hospital::EventSender;
use crate::ids::FlowId;

/// Schedules sleep wake-ups for suspended flows.
///
/// Each scheduled sleep is bound to one fiber instance through that
/// instance's own event channel: a flow replaced by a retry gets a fresh
/// channel, so a stale timer's wake-up lands nowhere instead of waking the
/// replacement.
pub struct FlowSleepScheduler {
    clock: Arc<dyn Clock>,
}

impl FlowSleepScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Cancel any in-flight wait and schedule a wake-up at `until`.
    pub fn sleep(&self, state: &mut StateMachineState, sender: EventSender, until: OffsetDateTime) {
        if let Some(prior) = state.future.take() {
            prior.cancel();
        }
        let delay = duration_until(self.clock.as_ref(), until);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Event::WakeUpFromSleep);
        });
        state.future = Some(FutureHandle::new(task.abort_handle()));
    }
}

fn duration_until(clock: &dyn Clock, until: OffsetDateTime) -> Duration {
    let delta = until - clock.now();
    if delta.is_negative() {
        Duration::ZERO
    } else {
        Duration::new(
            delta.whole_seconds().max(0) as u64,
            delta.subsec_nanoseconds().max(0) as u32,
        )
    }
}

/// Backoff delay before retry number `retry_count` of a timed flow, with
/// the given jitter sample in `[0, 1)`.
///
/// `max(1s, (1 + jitter) * timeout * backoff_base^min(retries, cap) / 2)`
pub fn timeout_delay_with_jitter(
    config: &FlowTimeoutConfig,
    retry_count: u32,
    jitter: f64,
) -> Duration {
    let exponent = retry_count.min(config.max_restart_count);
    let scaled = config.timeout.as_secs_f64() * config.backoff_base.powi(exponent as i32);
    let seconds = ((1.0 + jitter) * scaled / 2.0).max(1.0);
    Duration::from_secs_f64(seconds)
}

/// Backoff delay with a fresh jitter sample.
pub fn timeout_delay(config: &FlowTimeoutConfig, retry_count: u32) -> Duration {
    timeout_delay_with_jitter(config, retry_count, rand::thread_rng().gen::<f64>())
}

struct ScheduledTimeout {
    abort: AbortHandle,
    retry_count: u32,
}

/// Schedules the timed-retry timeout for flows that opted in.
///
/// Firing injects a timeout error, which the hospital treats as a
/// retry-from-safe-point trigger; each re-schedule backs off exponentially
/// up to the configured retry cap.
pub struct FlowTimeoutScheduler {
    config: FlowTimeoutConfig,
    timed_flows: Mutex<HashMap<FlowId, ScheduledTimeout>>,
    custom_timeouts: Mutex<HashMap<FlowId, Duration>>,
}

impl FlowTimeoutScheduler {
    pub fn new(config: FlowTimeoutConfig) -> Self {
        Self {
            config,
            timed_flows: Mutex::new(HashMap::new()),
            custom_timeouts: Mutex::new(HashMap::new()),
        }
    }

    /// Arm (or re-arm) the timeout for a flow. Re-arming cancels the
    /// pending timer and counts as one more retry for the backoff.
    pub fn schedule(&self, flow_id: FlowId, sender: EventSender) {
        let mut timed = self.timed_flows.lock().expect("timeout lock poisoned");
        let retry_count = match timed.remove(&flow_id) {
            Some(prior) => {
                prior.abort.abort();
                prior.retry_count + 1
            }
            None => 0,
        };

        let config = self.effective_config(flow_id);
        let delay = timeout_delay(&config, retry_count);
        debug!(flow_id = %flow_id, retry_count, delay_ms = delay.as_millis() as u64, "Scheduling flow timeout");

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Event::Error(FlowError::new(FlowErrorKind::FlowTimeout {
                retry_count,
            })));
        });
        timed.insert(
            flow_id,
            ScheduledTimeout {
                abort: task.abort_handle(),
                retry_count,
            },
        );
    }

    /// Disarm the timeout.
    pub fn cancel(&self, flow_id: FlowId) {
        if let Some(prior) = self
            .timed_flows
            .lock()
            .expect("timeout lock poisoned")
            .remove(&flow_id)
        {
            prior.abort.abort();
        }
        self.custom_timeouts
            .lock()
            .expect("timeout lock poisoned")
            .remove(&flow_id);
    }

    /// Request a longer timeout for one flow. Requests shorter than the
    /// configured default are ignored so a flow cannot weaken its own
    /// safety net.
    pub fn set_custom_timeout(&self, flow_id: FlowId, timeout: Duration) {
        if timeout <= self.config.timeout {
            warn!(
                flow_id = %flow_id,
                requested_ms = timeout.as_millis() as u64,
                "Ignoring custom timeout shorter than the configured default"
            );
            return;
        }
        self.custom_timeouts
            .lock()
            .expect("timeout lock poisoned")
            .insert(flow_id, timeout);
    }

    /// Retry count of the pending timeout, if armed.
    pub fn retry_count(&self, flow_id: FlowId) -> Option<u32> {
        self.timed_flows
            .lock()
            .expect("timeout lock poisoned")
            .get(&flow_id)
            .map(|t| t.retry_count)
    }

    fn effective_config(&self, flow_id: FlowId) -> FlowTimeoutConfig {
        let mut config = self.config.clone();
        if let Some(custom) = self
            .custom_timeouts
            .lock()
            .expect("timeout lock poisoned")
            .get(&flow_id)
        {
            config.timeout = *custom;
        }
        config
    }
}
