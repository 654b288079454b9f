//! Windowed pipeline scheduler
//!
//! Windowed stages (mean, stats, sampling) never emit synchronously: each
//! sample is stored here under its `{window, slide}` key, and the computed
//! aggregate is delivered when the key's deadline passes. One deadline is
//! pending at any time - the minimum across all keys - and is re-derived
//! under the same lock that guards the key set, so a tick can never observe
//! a half-updated schedule.

use crate::policy::FunctionKind;
use crate::time::Timestamp;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Identity of one windowed-computation instance. Equality is structural:
/// two stages with the same window and slide share samples and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub window_ms: u64,
    pub slide_ms: u64,
}

impl WindowKey {
    pub fn new(window_ms: u64, slide_ms: u64) -> Self {
        Self {
            window_ms,
            slide_ms,
        }
    }
}

/// A sample handed off by the pipeline executor, together with the
/// continuation needed to resume the pipeline after the fire.
#[derive(Debug, Clone)]
pub struct WindowRequest {
    pub key: WindowKey,
    pub kind: FunctionKind,
    pub attribute: String,
    /// Pipeline index of the stage after the windowed one
    pub resume_from: usize,
    pub sample: Value,
}

/// One aggregate produced by a fired window.
#[derive(Debug, Clone)]
pub struct WindowFire {
    pub key: WindowKey,
    pub attribute: String,
    pub value: Value,
    pub resume_from: usize,
}

/// Samples and continuation for one attribute under one key.
struct Accumulator {
    kind: FunctionKind,
    resume_from: usize,
    samples: Vec<Value>,
}

/// One active window slot.
struct Slot {
    /// Insertion order; breaks deadline ties deterministically
    seq: u64,
    deadline: Timestamp,
    accumulators: HashMap<String, Accumulator>,
}

struct Inner {
    slots: HashMap<WindowKey, Slot>,
    next_seq: u64,
    /// The single pending deadline: min over all slots
    next_deadline: Option<Timestamp>,
}

impl Inner {
    fn rearm(&mut self) {
        self.next_deadline = self.slots.values().map(|s| s.deadline).min();
    }
}

/// Fire counters, in the same spirit as the delivery stats.
#[derive(Default)]
pub struct WindowStats {
    pub samples_accepted: AtomicU64,
    pub fires: AtomicU64,
    pub keys_removed: AtomicU64,
}

/// Scheduler holding all active window slots for one device session.
pub struct WindowScheduler {
    inner: Mutex<Inner>,
    stats: WindowStats,
}

impl WindowScheduler {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                next_seq: 0,
                next_deadline: None,
            }),
            stats: WindowStats::default(),
        }
    }

    /// Store a sample. A new key arms at `now + slide`; an existing key's
    /// deadline is left untouched. The pending minimum deadline is updated
    /// in the same critical section.
    pub fn submit(&self, request: WindowRequest, now: Timestamp) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let next_seq = &mut inner.next_seq;
        let slot = inner.slots.entry(request.key).or_insert_with(|| {
            *next_seq += 1;
            trace!(
                window_ms = request.key.window_ms,
                slide_ms = request.key.slide_ms,
                "Window slot created"
            );
            Slot {
                seq: *next_seq,
                deadline: now.saturating_add(request.key.slide_ms),
                accumulators: HashMap::new(),
            }
        });

        let accumulator = slot
            .accumulators
            .entry(request.attribute)
            .or_insert_with(|| Accumulator {
                kind: request.kind,
                resume_from: request.resume_from,
                samples: Vec::new(),
            });
        accumulator.samples.push(request.sample);

        inner.rearm();

        self.stats.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Cancel a key without firing it (pipeline replaced, device closed).
    pub fn remove(&self, key: &WindowKey) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.slots.remove(key).is_some();
        if removed {
            inner.rearm();
            self.stats.keys_removed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every slot (device session closed).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.next_deadline = None;
    }

    /// The single pending deadline, if any slot is active.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.inner.lock().next_deadline
    }

    /// Fire every key whose deadline has passed. Due keys are processed in
    /// `(deadline, insertion order)` order; each fired key's accumulator is
    /// cleared and its deadline reset to `now + slide`. All aggregates from
    /// one call form one batch. Re-arms the pending deadline before
    /// returning.
    pub fn poll(&self, now: Timestamp) -> Vec<WindowFire> {
        let mut inner = self.inner.lock();

        match inner.next_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Vec::new(),
        }

        let mut due: Vec<(Timestamp, u64, WindowKey)> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(key, slot)| (slot.deadline, slot.seq, *key))
            .collect();
        due.sort_unstable_by_key(|(deadline, seq, _)| (*deadline, *seq));

        let mut fires = Vec::new();
        for (_, _, key) in due {
            let slot = match inner.slots.get_mut(&key) {
                Some(slot) => slot,
                None => continue,
            };

            let mut attributes: Vec<&String> = slot.accumulators.keys().collect();
            attributes.sort();
            let attributes: Vec<String> = attributes.into_iter().cloned().collect();

            for attribute in attributes {
                let accumulator = slot
                    .accumulators
                    .get_mut(&attribute)
                    .expect("attribute listed from this slot");
                if accumulator.samples.is_empty() {
                    continue;
                }
                let samples = std::mem::take(&mut accumulator.samples);
                match aggregate(&accumulator.kind, &samples) {
                    Some(value) => fires.push(WindowFire {
                        key,
                        attribute,
                        value,
                        resume_from: accumulator.resume_from,
                    }),
                    None => warn!(
                        attribute = attribute.as_str(),
                        kind = accumulator.kind.as_str(),
                        "Window fired with no usable samples"
                    ),
                }
            }

            slot.deadline = now.saturating_add(key.slide_ms);
        }

        inner.rearm();

        if !fires.is_empty() {
            self.stats
                .fires
                .fetch_add(fires.len() as u64, Ordering::Relaxed);
            debug!(count = fires.len(), now, "Window batch fired");
        }

        fires
    }

    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }
}

impl Default for WindowScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the aggregate for a set of samples.
fn aggregate(kind: &FunctionKind, samples: &[Value]) -> Option<Value> {
    match kind {
        FunctionKind::Mean => {
            let numbers = numeric(samples);
            if numbers.is_empty() {
                return None;
            }
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Some(json!(mean))
        }
        FunctionKind::Stats => {
            let numbers = numeric(samples);
            if numbers.is_empty() {
                return None;
            }
            let min = numbers.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Some(json!({
                "min": min,
                "max": max,
                "mean": mean,
                "count": numbers.len(),
            }))
        }
        // First sample of the window: deterministic representative
        FunctionKind::Sampling => samples.first().cloned(),
        _ => None,
    }
}

fn numeric(samples: &[Value]) -> Vec<f64> {
    samples.iter().filter_map(Value::as_f64).collect()
}
