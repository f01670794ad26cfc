//! Active-upstream selection and rotation.
//!
//! Rotation trigger sources:
//!   - Time interval (`rotate_interval`)
//!   - Request count (`rotate_requests`)
//!   - Connection errors (`rotate_conn_errors`)
//!   - HTTP errors reported via the API (`rotate_http_errors`)
//!   - Manual (`POST /api/rotate`)
//!
//! On rotation the old upstream is drained: connections already in flight
//! finish on the upstream they captured, new connections pick the fresh
//! current. Triggers are funneled through a bounded queue consumed by a
//! single worker, which coalesces bursts into one rotation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, RotorError};
use crate::models::Upstream;
use crate::pool::Pool;

/// Capacity of the rotation trigger queue. Senders drop the event when the
/// queue is full; a rotation is already pending in that case.
const ROTATE_QUEUE_CAPACITY: usize = 16;

const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Rotation thresholds. A zero value disables the corresponding trigger.
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Rotate on a fixed wall-clock schedule. Zero disables.
    pub rotate_interval: Duration,
    /// Rotate after this many requests on the current upstream.
    pub rotate_requests: i64,
    /// Rotate after this many dial failures on the current upstream.
    pub rotate_conn_errors: i64,
    /// Rotate after this many bad HTTP statuses reported via the API.
    pub rotate_http_errors: i64,
    /// Window within which repeated error reports for one destination
    /// count once. Doubles as the post-rotation grace period.
    pub dedup_window: Duration,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            rotate_interval: Duration::ZERO,
            rotate_requests: 0,
            rotate_conn_errors: 0,
            rotate_http_errors: 0,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug)]
struct RotatorState {
    current: Option<Arc<Upstream>>,
    generation: u64,
    /// Time of the most recent rotation away from a previous upstream.
    /// None until the first real (non-startup) rotation, so the grace
    /// period never suppresses reports before anything rotated.
    rotated_at: Option<Instant>,
}

/// Selects and rotates the active upstream proxy.
#[derive(Debug)]
pub struct Rotator {
    pool: Arc<Pool>,
    cfg: RotatorConfig,

    state: RwLock<RotatorState>,

    /// Domain → pinned upstream, session-scoped. Purged automatically
    /// when the pinned upstream is rotated out.
    ///
    /// Lock order: pins before state, everywhere.
    pins: Mutex<HashMap<String, Arc<Upstream>>>,

    /// Destination domain → last counted HTTP error report.
    recent_http_errors: DashMap<String, Instant>,

    rotate_tx: mpsc::Sender<String>,
    rotate_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Rotator {
    /// Create a rotator and synchronously pick the first upstream.
    /// Fails when the pool has no alive members.
    pub fn new(pool: Arc<Pool>, mut cfg: RotatorConfig) -> Result<Self> {
        if cfg.dedup_window.is_zero() {
            cfg.dedup_window = DEFAULT_DEDUP_WINDOW;
        }

        let (rotate_tx, rotate_rx) = mpsc::channel(ROTATE_QUEUE_CAPACITY);

        let rotator = Self {
            pool,
            cfg,
            state: RwLock::new(RotatorState {
                current: None,
                generation: 0,
                rotated_at: None,
            }),
            pins: Mutex::new(HashMap::new()),
            recent_http_errors: DashMap::new(),
            rotate_tx,
            rotate_rx: Mutex::new(Some(rotate_rx)),
        };

        rotator.pick_next("startup")?;
        Ok(rotator)
    }

    /// The currently active upstream.
    pub fn current(&self) -> Option<Arc<Upstream>> {
        self.state.read().current.clone()
    }

    /// Rotation generation counter. Increments by exactly one per
    /// successful rotation, startup included. Callers can compare two
    /// reads to detect whether the active upstream changed in between.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// The upstream to use for a destination (`host` or `host:port`).
    ///
    /// A domain pinned to a still-alive upstream keeps that upstream.
    /// Otherwise the current upstream is returned and the domain is
    /// pinned to it for the rest of the session. Returns None only when
    /// no upstream has ever been selectable.
    pub fn select_for(&self, destination: &str) -> Option<Arc<Upstream>> {
        let domain = extract_domain(destination);

        // Holding the pin lock across the current-read serializes this
        // call against pick_next, which takes pins before state too.
        let mut pins = self.pins.lock();

        if let Some(pinned) = pins.get(&domain) {
            if pinned.is_alive() {
                return Some(pinned.clone());
            }
        }

        let current = self.state.read().current.clone();
        if let Some(cur) = &current {
            pins.insert(domain, cur.clone());
        }
        current
    }

    /// Queue a manual rotation.
    pub fn force_rotate(&self) {
        self.trigger("manual".to_string());
    }

    /// Count one served request on the current upstream and queue a
    /// rotation when the request threshold is crossed.
    pub fn record_request(&self) {
        let Some(cur) = self.current() else { return };
        let n = cur.req_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if self.cfg.rotate_requests > 0 && n >= self.cfg.rotate_requests {
            self.trigger(format!("request-count={}", n));
        }
    }

    /// Count one dial failure on the current upstream and queue a
    /// rotation when the connection-error threshold is crossed.
    pub fn record_conn_error(&self) {
        let Some(cur) = self.current() else { return };
        let n = cur.conn_errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if self.cfg.rotate_conn_errors > 0 && n >= self.cfg.rotate_conn_errors {
            self.trigger(format!("conn-errors={}", n));
        }
    }

    /// Count a bad HTTP status reported for a destination.
    ///
    /// Reports for the same destination within the dedup window count
    /// once. Reports arriving within one window after a rotation are
    /// dropped entirely; queued requests tend to flush a burst of
    /// failures that belong to the upstream just rotated away from.
    pub fn report_http_error(&self, destination: &str) {
        if self.cfg.rotate_http_errors <= 0 {
            return;
        }

        let domain = extract_domain(destination);
        let window = self.cfg.dedup_window;
        let now = Instant::now();

        match self.recent_http_errors.entry(domain.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < window {
                    debug!(%domain, "duplicate HTTP error report within dedup window");
                    return;
                }
                entry.insert(now);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }
        // The map would otherwise grow with every destination ever seen.
        self.recent_http_errors
            .retain(|_, stamp| now.duration_since(*stamp) < window);

        let (rotated_at, current) = {
            let state = self.state.read();
            (state.rotated_at, state.current.clone())
        };

        if let Some(at) = rotated_at {
            if now.duration_since(at) < window {
                debug!(%domain, "HTTP error report within post-rotation grace period");
                return;
            }
        }
        let Some(cur) = current else { return };

        let n = cur.http_errors.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if n >= self.cfg.rotate_http_errors {
            self.trigger(format!("http-errors={} destination={}", n, domain));
        }
    }

    /// Launch the rotation worker and, when configured, the interval
    /// ticker. Panics if called twice.
    pub fn start(self: &Arc<Self>) -> RotatorHandle {
        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let rx = self
            .rotate_rx
            .lock()
            .take()
            .expect("rotator started twice");

        let rotator = self.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            rotator.rotation_loop(rx, shutdown).await;
        }));

        if !self.cfg.rotate_interval.is_zero() {
            let rotator = self.clone();
            let shutdown = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                rotator.interval_loop(shutdown).await;
            }));
        }

        RotatorHandle { shutdown_tx, tasks }
    }

    /// Non-blocking trigger send; drops when the queue is full (a
    /// rotation is already pending).
    fn trigger(&self, reason: String) {
        if self.rotate_tx.try_send(reason).is_err() {
            debug!("rotation queue full, trigger dropped");
        }
    }

    /// Drains the trigger queue and performs rotations. Back-to-back
    /// triggers that queued up while a rotation ran are coalesced into a
    /// single rotation with a `+`-joined reason.
    async fn rotation_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(mut reason) = received else { break };
                    while let Ok(extra) = rx.try_recv() {
                        reason.push('+');
                        reason.push_str(&extra);
                    }
                    if let Err(e) = self.pick_next(&reason) {
                        warn!(%reason, "rotation failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn interval_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.cfg.rotate_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.trigger("interval".to_string());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Rotate to the next alive upstream (round-robin over the alive
    /// snapshot) without disturbing in-flight connections.
    fn pick_next(&self, reason: &str) -> Result<()> {
        let alive = self.pool.alive_snapshot();
        if alive.is_empty() {
            return Err(RotorError::NoAliveUpstreams);
        }

        // Pins first, then state: pin purging must be atomic with the
        // generation bump so no selection can observe the new generation
        // alongside a pin to the rotated-out upstream.
        let mut pins = self.pins.lock();
        let mut state = self.state.write();

        let next_index = match &state.current {
            None => 0,
            Some(cur) => alive
                .iter()
                .position(|up| Arc::ptr_eq(up, cur))
                // Current upstream no longer alive: restart from the front.
                .map_or(0, |i| (i + 1) % alive.len()),
        };

        let prev = state.current.clone();
        let next = alive[next_index].clone();
        state.current = Some(next.clone());
        state.generation += 1;
        // The very first pick is not a rotation; error reports right
        // after startup must not fall into the grace period.
        if prev.is_some() {
            state.rotated_at = Some(Instant::now());
        }

        next.reset_counters();

        if let Some(prev) = &prev {
            if !Arc::ptr_eq(prev, &next) {
                pins.retain(|_, pinned| !Arc::ptr_eq(pinned, prev));
            }
        }

        info!(
            generation = state.generation,
            reason,
            prev = %prev.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "<none>".to_string()),
            next = %next,
            draining_conns = prev
                .as_ref()
                .map(|p| p.active_conns.load(std::sync::atomic::Ordering::SeqCst))
                .unwrap_or(0),
            "rotated upstream"
        );
        Ok(())
    }
}

/// Handle for shutting down the rotator's background tasks.
pub struct RotatorHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RotatorHandle {
    /// Signal the worker and ticker to exit and wait for them. Pending
    /// queued triggers are discarded.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Strip a trailing `:port` from a destination and lowercase the rest.
/// The last segment only counts as a port when it is all digits and the
/// remainder is not itself colon-separated (a bare IPv6 literal) or is
/// bracketed.
fn extract_domain(destination: &str) -> String {
    if let Some(idx) = destination.rfind(':') {
        let (head, port) = (&destination[..idx], &destination[idx + 1..]);
        let port_like = !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit());
        if port_like && (!head.contains(':') || head.ends_with(']')) {
            return head.to_lowercase();
        }
    }
    destination.to_lowercase()
}
