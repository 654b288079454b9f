//! Cooperative tick scheduler
//!
//! One shared periodic tick drives every component that needs time:
//! delivery drains, window deadlines, transfer dispatch. Components
//! register a callback instead of owning a timer; the first registration
//! arms the tick task and dropping the last registration disarms it, so no
//! timer outlives its users.
//!
//! Callbacks run synchronously, one after another, within a tick. There is
//! no ordering guarantee between distinct registrants, and a long-running
//! callback delays all others - callbacks must hand long work to spawned
//! tasks. A callback error is logged and contained; the next callback and
//! the next tick always run.

use crate::time::{Clock, Timestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tick callback. Invariant: must not register or unregister monitor
/// callbacks from inside the tick.
pub type TickFn = Box<dyn FnMut(Timestamp) -> anyhow::Result<()> + Send>;

struct CallbackSlot {
    id: u64,
    name: String,
    callback: TickFn,
}

struct MonitorInner {
    interval: Duration,
    clock: Arc<dyn Clock>,
    callbacks: Mutex<Vec<CallbackSlot>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl MonitorInner {
    fn run_tick(&self) {
        let now = self.clock.now();
        let mut callbacks = self.callbacks.lock();
        for slot in callbacks.iter_mut() {
            if let Err(e) = (slot.callback)(now) {
                warn!(callback = slot.name.as_str(), error = %e, "Tick callback failed");
            }
        }
    }

    fn unregister(self: &Arc<Self>, id: u64) {
        let mut callbacks = self.callbacks.lock();
        callbacks.retain(|slot| slot.id != id);
        if callbacks.is_empty() {
            drop(callbacks);
            if let Some(task) = self.tick_task.lock().take() {
                task.abort();
                debug!("Monitor disarmed");
            }
        }
    }
}

/// The shared periodic-tick multiplexer for one device session.
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                interval,
                clock,
                callbacks: Mutex::new(Vec::new()),
                tick_task: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a tick callback. The returned guard unregisters on drop;
    /// the tick source is armed with the first registration.
    pub fn register(
        &self,
        name: impl Into<String>,
        callback: impl FnMut(Timestamp) -> anyhow::Result<()> + Send + 'static,
    ) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        debug!(callback = name.as_str(), "Monitor callback registered");

        let mut callbacks = self.inner.callbacks.lock();
        let was_empty = callbacks.is_empty();
        callbacks.push(CallbackSlot {
            id,
            name,
            callback: Box::new(callback),
        });
        drop(callbacks);

        if was_empty {
            self.arm();
        }

        Registration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn arm(&self) {
        let mut tick_task = self.inner.tick_task.lock();
        if tick_task.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let interval = inner.interval;
        *tick_task = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                inner.run_tick();
            }
        }));
        debug!(interval_ms = interval.as_millis() as u64, "Monitor armed");
    }

    /// Run every registered callback once, immediately. Drives tests and
    /// explicit flush paths without waiting for the interval.
    pub fn tick_now(&self) {
        self.inner.run_tick();
    }

    /// Number of registered callbacks.
    pub fn registered(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    /// Whether the tick task is currently armed.
    pub fn is_armed(&self) -> bool {
        self.inner.tick_task.lock().is_some()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(task) = self.inner.tick_task.lock().take() {
            task.abort();
        }
    }
}

/// Guard for one registered callback; unregisters on drop.
pub struct Registration {
    inner: Weak<MonitorInner>,
    id: u64,
}

impl Registration {
    /// Unregister now instead of at drop time.
    pub fn cancel(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn monitor() -> Monitor {
        Monitor::new(Duration::from_millis(10), Arc::new(ManualClock::new(0)))
    }

    #[tokio::test]
    async fn arms_on_first_registration_and_disarms_on_last() {
        let monitor = monitor();
        assert!(!monitor.is_armed());

        let a = monitor.register("a", |_| Ok(()));
        assert!(monitor.is_armed());
        let b = monitor.register("b", |_| Ok(()));
        assert_eq!(monitor.registered(), 2);

        drop(a);
        assert!(monitor.is_armed());

        drop(b);
        assert!(!monitor.is_armed());
        assert_eq!(monitor.registered(), 0);
    }

    #[tokio::test]
    async fn callback_error_does_not_stop_other_callbacks() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));

        let _bad = monitor.register("bad", |_| anyhow::bail!("boom"));
        let calls_clone = calls.clone();
        let _good = monitor.register("good", move |_| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        monitor.tick_now();
        monitor.tick_now();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn callbacks_receive_clock_time() {
        let clock = Arc::new(ManualClock::new(500));
        let monitor = Monitor::new(Duration::from_millis(10), clock.clone());

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let _reg = monitor.register("probe", move |now| {
            seen_clone.store(now, Ordering::Relaxed);
            Ok(())
        });

        monitor.tick_now();
        assert_eq!(seen.load(Ordering::Relaxed), 500);

        clock.advance(250);
        monitor.tick_now();
        assert_eq!(seen.load(Ordering::Relaxed), 750);
    }

    #[tokio::test]
    async fn ticks_fire_from_interval() {
        let monitor = Monitor::new(
            Duration::from_millis(5),
            Arc::new(ManualClock::new(0)),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let _reg = monitor.register("counter", move |_| {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(calls.load(Ordering::Relaxed) >= 2);
    }
}
