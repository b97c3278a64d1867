//! Bounded worker pool that warms the real cache for canonicalized URLs.
//!
//! Grounded on `Fetch(threading.Thread)` in the original `fetch.py`: pull
//! one `(canonical, original)` pair off a queue, skip it if a `X-Cache:
//! HIT*` response header says the real cache already has it, otherwise
//! drain the body and let Squid's normal fetch path populate the cache.
//! Workers are OS threads rather than async tasks, the way the teacher's
//! worker pools and `reqwest::blocking` callers in the retrieval pack do
//! this kind of low-volume, IO-bound fan-out.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::config::ConfigSnapshot;

const RECV_POLL: Duration = Duration::from_millis(500);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_CHUNK: usize = 8 * 1024;

/// Process-wide record of which canonical URLs already have a fetch in
/// flight or completed. Survives config reloads; only cleared by restarting
/// the process. Every original URL that mapped to the same canonical is
/// remembered too, purely for diagnostics.
pub struct PrefetchLedger {
    inner: Mutex<HashMap<String, HashSet<String>>>,
}

impl PrefetchLedger {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Records `original` under `canonical`, returning `true` the first
    /// time `canonical` is seen (the caller should proceed with the fetch)
    /// and `false` if another worker already claimed it.
    pub fn record(&self, canonical: &str, original: &str) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.entry(canonical.to_string()).or_default();
        let first = entry.is_empty();
        entry.insert(original.to_string());
        first
    }
}

impl Default for PrefetchLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client(snapshot: &ConfigSnapshot) -> reqwest::blocking::Client {
    let mut builder = reqwest::blocking::Client::builder().timeout(FETCH_TIMEOUT).connect_timeout(FETCH_TIMEOUT);
    if let Some(proxy) = &snapshot.http_proxy {
        match reqwest::Proxy::http(proxy) {
            Ok(p) => builder = builder.proxy(p),
            Err(e) => log::error!("invalid http_proxy '{proxy}': {e}"),
        }
    }
    if let Some(proxy) = &snapshot.https_proxy {
        match reqwest::Proxy::https(proxy) {
            Ok(p) => builder = builder.proxy(p),
            Err(e) => log::error!("invalid https_proxy '{proxy}': {e}"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        log::error!("failed to build prefetch HTTP client, falling back to defaults: {e}");
        reqwest::blocking::Client::new()
    })
}

fn is_cache_hit(resp: &reqwest::blocking::Response) -> bool {
    resp.headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_uppercase().starts_with("HIT"))
        .unwrap_or(false)
}

fn drain_body(mut resp: reqwest::blocking::Response) {
    let mut buf = [0u8; DRAIN_CHUNK];
    loop {
        match resp.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                log::error!("prefetch body read error: {e}");
                break;
            }
        }
    }
}

fn process_one(
    canonical: &str,
    original: &str,
    ledger: &PrefetchLedger,
    client: &reqwest::blocking::Client,
    fetch_delay: Duration,
) {
    if !ledger.record(canonical, original) {
        log::debug!("prefetch already scheduled for {canonical}");
        return;
    }
    if fetch_delay > Duration::ZERO {
        thread::sleep(fetch_delay);
    }
    match client.get(original).send() {
        Ok(resp) => {
            if is_cache_hit(&resp) {
                log::debug!("prefetch skipped, already a cache hit: {original}");
                return;
            }
            log::info!("prefetched {original} ({})", resp.status());
            drain_body(resp);
        }
        Err(e) => log::error!("prefetch fetch failed for {original}: {e}"),
    }
}

fn worker_loop(
    id: usize,
    rx: Receiver<(String, String)>,
    ledger: Arc<PrefetchLedger>,
    published: Arc<RwLock<Arc<ConfigSnapshot>>>,
    shutdown: Arc<AtomicBool>,
    generation_stop: Arc<AtomicBool>,
) {
    let mut snapshot = Arc::clone(&*published.read().unwrap());
    let mut client = build_client(&snapshot);

    while !shutdown.load(Ordering::Relaxed) && !generation_stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(RECV_POLL) {
            Ok((canonical, original)) => {
                let latest = Arc::clone(&*published.read().unwrap());
                if !Arc::ptr_eq(&latest, &snapshot) {
                    snapshot = latest;
                    client = build_client(&snapshot);
                }
                let delay = snapshot.fetch_delay;
                let result = catch_unwind(AssertUnwindSafe(|| {
                    process_one(&canonical, &original, &ledger, &client, delay);
                }));
                if let Err(panic) = result {
                    log::error!("prefetch worker {id} panicked on {original}: {panic:?}");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// A running generation of prefetch workers, stoppable independently of the
/// process-wide shutdown flag so the supervisor can quiesce and restart the
/// pool across a config reload.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    generation_stop: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn spawn(
        count: u32,
        rx: Receiver<(String, String)>,
        ledger: Arc<PrefetchLedger>,
        published: Arc<RwLock<Arc<ConfigSnapshot>>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let generation_stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(count as usize);
        for id in 0..count {
            let rx = rx.clone();
            let ledger = Arc::clone(&ledger);
            let published = Arc::clone(&published);
            let shutdown = Arc::clone(&shutdown);
            let generation_stop = Arc::clone(&generation_stop);
            let handle = thread::Builder::new()
                .name(format!("prefetch-{id}"))
                .spawn(move || worker_loop(id, rx, ledger, published, shutdown, generation_stop))
                .expect("spawn prefetch worker thread");
            handles.push(handle);
        }
        Self { handles, generation_stop }
    }

    /// Signals every worker in this generation to stop, then waits up to
    /// `timeout` for them to finish. Workers still mid-fetch past the
    /// deadline are left to exit on their own; the ledger and queue they
    /// touch are process-wide and tolerate the straggler.
    pub fn quiesce(self, timeout: Duration) {
        self.generation_stop.store(true, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        for handle in self.handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            let start = Instant::now();
            while !handle.is_finished() && start.elapsed() < remaining {
                thread::sleep(Duration::from_millis(25));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_claims_canonical_once() {
        let ledger = PrefetchLedger::new();
        assert!(ledger.record("http://a.internal/x", "http://a.example/x"));
        assert!(!ledger.record("http://a.internal/x", "http://a.example/x?ref=1"));
        assert!(ledger.record("http://b.internal/y", "http://b.example/y"));
    }
}
