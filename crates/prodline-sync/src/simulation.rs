//! Local producer/consumer simulation.
//!
//! Used when no remote backend is attached. The engine speaks the same
//! [`StreamEvent`] vocabulary as a remote source: every change it makes is a
//! list of events reduced inside a single store patch, then re-published on
//! a broadcast channel as wire messages.
//!
//! Per machine: `idle -> processing -> idle`. A tick starts a cycle for every
//! idle machine with a non-empty input queue. The cycle's completion is a
//! spawned timer carrying its own [`CancellationToken`]; at most one exists
//! per machine and all of them are cancelled by [`LocalEngine::stop`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use prodline_model::{
    Product, QueueEventKind, QueueEventPayload, SimulationState, StreamMessage,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{Effect, Normalizer, StreamEvent};

/// Display colors handed to products and busy machines.
pub const PALETTE: [&str; 8] = [
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#06b6d4", "#3b82f6", "#8b5cf6", "#ec4899",
];

const EVENT_BUFFER: usize = 256;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Queue that received an external arrival, if any
    pub arrival: Option<String>,
    /// Machines whose completion was scheduled this tick
    pub started: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.arrival.is_none() && self.started.is_empty()
    }
}

struct Pending {
    cycle: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
    product: Option<Product>,
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    normalizer: Normalizer,
    config: SyncConfig,
    rng: Mutex<StdRng>,
    pending: Mutex<HashMap<String, Pending>>,
    ticker: Mutex<Option<Ticker>>,
    events: broadcast::Sender<StreamMessage>,
    next_product: AtomicU64,
    next_cycle: AtomicU64,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let ticker = self.ticker.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(ticker) = ticker.take() {
            ticker.token.cancel();
            ticker.handle.abort();
        }
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, p) in pending.drain() {
            p.token.cancel();
            p.handle.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the local simulation. Clones drive the same engine.
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

impl LocalEngine {
    /// Create a stopped engine feeding `normalizer`'s store.
    pub fn new(normalizer: Normalizer, config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            inner: Arc::new(EngineInner {
                normalizer,
                config,
                rng: Mutex::new(rng),
                pending: Mutex::new(HashMap::new()),
                ticker: Mutex::new(None),
                events,
                next_product: AtomicU64::new(1),
                next_cycle: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Wire messages for every event the engine generates.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamMessage> {
        self.inner.events.subscribe()
    }

    /// Whether the tick loop is active.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.ticker).is_some()
    }

    /// Number of completions currently scheduled.
    pub fn pending_completions(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn has_pending(&self, machine_id: &str) -> bool {
        lock(&self.inner.pending).contains_key(machine_id)
    }

    /// A processing time drawn from the configured range.
    pub fn random_processing_time(&self) -> u64 {
        let (min, max) = (self.inner.config.min_processing_ms, self.inner.config.max_processing_ms);
        lock(&self.inner.rng).gen_range(min..=max)
    }

    /// Start the tick loop. Returns false if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut ticker = lock(&self.inner.ticker);
        if ticker.is_some() {
            return false;
        }
        let token = CancellationToken::new();
        let period = self.inner.config.tick_interval;
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(run_ticker(weak, token.clone(), period));
        *ticker = Some(Ticker { token, handle });
        drop(ticker);

        info!(tick_ms = period.as_millis() as u64, "local simulation started");
        self.publish(StreamEvent::SimulationStarted);
        true
    }

    /// Stop the tick loop and cancel every scheduled completion.
    ///
    /// Machines caught mid-cycle stay `processing`; the next tick after a
    /// restart schedules a fresh completion for them. Returns the number of
    /// completions cancelled.
    pub fn stop(&self) -> usize {
        let ticker = lock(&self.inner.ticker).take();
        let cancelled = self.cancel_pending(ticker.as_ref().map(|t| &t.token));
        if let Some(ticker) = ticker {
            ticker.handle.abort();
            info!(cancelled, "local simulation stopped");
            self.publish(StreamEvent::SimulationStopped);
        }
        cancelled
    }

    /// Drain every scheduled completion. `ticker` is cancelled under the same
    /// lock, so a tick already past its own cancellation check has finished
    /// scheduling before the drain and one that is not yet there sees it.
    fn cancel_pending(&self, ticker: Option<&CancellationToken>) -> usize {
        let mut pending = lock(&self.inner.pending);
        if let Some(token) = ticker {
            token.cancel();
        }
        let count = pending.len();
        for (machine_id, p) in pending.drain() {
            trace!(%machine_id, cycle = p.cycle, "cancelling completion");
            p.token.cancel();
            p.handle.abort();
        }
        count
    }

    /// Advance one step: maybe inject an arrival, then start a cycle on every
    /// eligible machine. All of it lands as one store mutation.
    pub fn tick(&self) -> TickReport {
        self.tick_guarded(None)
    }

    fn tick_guarded(&self, guard: Option<&CancellationToken>) -> TickReport {
        let inner = &self.inner;
        // Held across the patch: no completion can be added or removed while
        // the tick decides which machines are eligible.
        let mut pending = lock(&inner.pending);
        if guard.is_some_and(CancellationToken::is_cancelled) {
            return TickReport::default();
        }
        let mut rng = lock(&inner.rng);

        let planned = inner.normalizer.store().try_patch(|state| {
            let mut events = Vec::new();
            let mut report = TickReport::default();

            if !state.queues.is_empty() && rng.gen_bool(inner.config.arrival_probability) {
                let idx = rng.gen_range(0..state.queues.len());
                let product = self.fresh_product(&mut rng);
                let queue = &state.queues[idx];
                let event = StreamEvent::QueueEvent(QueueEventPayload {
                    event_type: QueueEventKind::ProductAdded,
                    queue_id: queue.id.clone(),
                    product_id: Some(product.id.clone()),
                    product_color: Some(product.color.clone()),
                    new_queue_size: queue.product_count + 1,
                    total_products_generated: None,
                });
                report.arrival = Some(queue.id.clone());
                Normalizer::reduce(state, &event);
                events.push(event);
                events.push(StreamEvent::ProductAdded(serde_json::json!({
                    "queueId": report.arrival,
                    "productId": product.id,
                    "productColor": product.color,
                })));
            }

            let mut starts = Vec::new();
            let machine_ids: Vec<String> = state.machines.iter().map(|m| m.id.clone()).collect();
            for machine_id in machine_ids {
                if pending.contains_key(&machine_id) {
                    continue;
                }
                let Some(machine) = state.machine(&machine_id) else {
                    continue;
                };
                if !machine.is_idle() {
                    // Processing with no timer: adopted from an external state.
                    debug!(%machine_id, "adopting in-flight cycle");
                    starts.push((machine_id, machine.processing_time, None));
                    continue;
                }
                let Some((queue_id, product, events_taken)) = take_input(state, &machine_id) else {
                    continue;
                };
                events.push(events_taken);

                let color = PALETTE[rng.gen_range(0..PALETTE.len())];
                let output = state.output_connection(&machine_id).map(|c| c.target_id.clone());
                let Some(machine) = state.machine(&machine_id) else {
                    continue;
                };
                let mut next = machine.clone();
                next.begin_processing(color);
                next.input_queue_id = Some(queue_id.clone());
                next.output_queue_id = output;
                let duration = next.processing_time;
                let event = StreamEvent::MachineUpdate(next);
                Normalizer::reduce(state, &event);
                events.push(event);

                debug!(%machine_id, %queue_id, duration_ms = duration, "cycle started");
                starts.push((machine_id, duration, product));
            }

            if events.is_empty() && starts.is_empty() {
                return None;
            }
            // Emitted under the store lock so the wire order matches revisions.
            for event in &events {
                self.emit(event);
            }
            Some((starts, report))
        });
        drop(rng);

        let Some((starts, mut report)) = planned else {
            return TickReport::default();
        };
        for (machine_id, duration, product) in starts {
            self.schedule(&mut pending, machine_id.clone(), duration, product);
            report.started.push(machine_id);
        }
        report
    }

    fn fresh_product(&self, rng: &mut StdRng) -> Product {
        let n = self.inner.next_product.fetch_add(1, Ordering::Relaxed);
        Product {
            id: format!("P{n}"),
            color: PALETTE[rng.gen_range(0..PALETTE.len())].to_string(),
        }
    }

    fn schedule(
        &self,
        pending: &mut HashMap<String, Pending>,
        machine_id: String,
        duration_ms: u64,
        product: Option<Product>,
    ) {
        let cycle = self.inner.next_cycle.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let weak = Arc::downgrade(&self.inner);
        let id = machine_id.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
                    if let Some(inner) = weak.upgrade() {
                        LocalEngine { inner }.complete(&id, cycle);
                    }
                }
            }
        });
        pending.insert(
            machine_id,
            Pending {
                cycle,
                token,
                handle,
                product,
            },
        );
    }

    /// Finish a processing cycle: flash, go idle, and deliver the product to
    /// the output queue if one is routed.
    fn complete(&self, machine_id: &str, cycle: u64) {
        let inner = &self.inner;
        let mut pending = lock(&inner.pending);
        match pending.get(machine_id) {
            Some(p) if p.cycle == cycle && !p.token.is_cancelled() => {}
            _ => {
                trace!(%machine_id, cycle, "stale completion");
                return;
            }
        }
        let Some(done) = pending.remove(machine_id) else {
            return;
        };

        if inner.normalizer.store().current().machine(machine_id).is_none() {
            debug!(%machine_id, "machine removed before completion");
            return;
        }

        let flash = StreamEvent::MachineFlash {
            machine_id: machine_id.to_string(),
        };
        inner.normalizer.forward(Effect::Flash(machine_id.to_string()));
        self.emit(&flash);

        let planned = inner.normalizer.store().try_patch(|state| {
            let machine = state.machine(machine_id)?;
            let color = machine.current_product_color.clone();
            let mut idle = machine.clone();
            idle.finish_processing();
            let mut events = vec![StreamEvent::MachineUpdate(idle)];

            let output = state
                .output_connection(machine_id)
                .map(|c| c.target_id.clone())
                .and_then(|id| state.queue(&id).map(|q| (id, q.product_count)));
            if let Some((queue_id, count)) = output {
                let product = done.product.clone().unwrap_or_else(|| {
                    let n = inner.next_product.fetch_add(1, Ordering::Relaxed);
                    Product {
                        id: format!("P{n}"),
                        color: color.unwrap_or_else(|| PALETTE[0].to_string()),
                    }
                });
                events.push(StreamEvent::QueueEvent(QueueEventPayload {
                    event_type: QueueEventKind::ProductAdded,
                    queue_id: queue_id.clone(),
                    product_id: Some(product.id.clone()),
                    product_color: Some(product.color.clone()),
                    new_queue_size: count + 1,
                    total_products_generated: None,
                }));
                events.push(StreamEvent::ProductProcessed(serde_json::json!({
                    "machineId": machine_id,
                    "productId": product.id,
                    "outputQueueId": queue_id,
                })));
            }
            for event in &events {
                Normalizer::reduce(state, event);
                self.emit(event);
            }
            Some(())
        });
        drop(pending);

        match planned {
            Some(()) => debug!(%machine_id, cycle, "cycle finished"),
            None => debug!(%machine_id, "machine removed before completion"),
        }
    }

    fn publish(&self, event: StreamEvent) {
        self.inner.normalizer.store().patch(|state| {
            Normalizer::reduce(state, &event);
            self.emit(&event);
        });
    }

    /// Put an event on the wire channel without touching the store.
    pub fn emit(&self, event: &StreamEvent) {
        // No receivers is the normal case when nothing is watching.
        let _ = self.inner.events.send(event.to_message());
    }
}

/// Take one product from the machine's first non-empty input queue.
fn take_input(
    state: &mut SimulationState,
    machine_id: &str,
) -> Option<(String, Option<Product>, StreamEvent)> {
    let queue_id = state
        .input_connections(machine_id)
        .into_iter()
        .map(|c| c.source_id.clone())
        .find(|id| state.queue(id).is_some_and(|q| q.product_count > 0))?;
    let queue = state.queue(&queue_id)?;
    let product = if queue.is_tracked() {
        queue.products.first().cloned()
    } else {
        None
    };
    let event = StreamEvent::QueueEvent(QueueEventPayload {
        event_type: QueueEventKind::ProductRemoved,
        queue_id: queue_id.clone(),
        product_id: product.as_ref().map(|p| p.id.clone()),
        product_color: product.as_ref().map(|p| p.color.clone()),
        new_queue_size: queue.product_count - 1,
        total_products_generated: None,
    });
    Normalizer::reduce(state, &event);
    Some((queue_id, product, event))
}

async fn run_ticker(engine: Weak<EngineInner>, token: CancellationToken, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = engine.upgrade() else { break };
                let report = LocalEngine { inner }.tick_guarded(Some(&token));
                if !report.is_empty() {
                    trace!(?report, "tick");
                }
            }
        }
    }
}
