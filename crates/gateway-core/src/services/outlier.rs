//! Outlier detection for the `outlier_ejection` resilience stage (§4.2 phase
//! 6, spec body §"Outlier detection"). New module — no teacher counterpart;
//! tracks a rolling error count per backend and ejects (marks unhealthy)
//! once consecutive failures cross a threshold, reinstating after a
//! cooldown so [`crate::services::health::run_health_sweep`] can observe it
//! again.

use crate::services::backend::Backend;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub struct OutlierDetectorSpec {
    pub consecutive_failure_threshold: u32,
    pub ejection_cooldown: Duration,
}

impl Default for OutlierDetectorSpec {
    fn default() -> Self {
        Self { consecutive_failure_threshold: 5, ejection_cooldown: Duration::from_secs(30) }
    }
}

struct BackendState {
    consecutive_failures: u32,
    ejected_at: Option<Instant>,
}

/// One detector per route, tracking consecutive failures per backend URL and
/// ejecting/reinstating through the shared [`Backend`] health flag.
pub struct OutlierDetector {
    spec: OutlierDetectorSpec,
    state: Mutex<HashMap<String, BackendState>>,
    backends: RwLock<HashMap<String, Arc<Backend>>>,
}

impl OutlierDetector {
    pub fn new(spec: OutlierDetectorSpec) -> Self {
        Self { spec, state: Mutex::new(HashMap::new()), backends: RwLock::new(HashMap::new()) }
    }

    pub fn track(&self, backend: Arc<Backend>) {
        self.backends.write().unwrap().insert(backend.url.clone(), backend);
    }

    pub fn record_success(&self, backend_url: &str) {
        let mut state = self.state.lock().unwrap();
        state.entry(backend_url.to_string()).or_insert(BackendState { consecutive_failures: 0, ejected_at: None }).consecutive_failures = 0;
    }

    /// Records a failure; ejects the backend once the threshold is crossed.
    pub fn record_failure(&self, backend_url: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(backend_url.to_string()).or_insert(BackendState { consecutive_failures: 0, ejected_at: None });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.spec.consecutive_failure_threshold && entry.ejected_at.is_none() {
            entry.ejected_at = Some(Instant::now());
            if let Some(backend) = self.backends.read().unwrap().get(backend_url) {
                backend.mark_unhealthy();
            }
        }
    }

    /// Reinstates any ejected backend whose cooldown has elapsed.
    pub fn sweep_reinstate(&self) {
        let mut state = self.state.lock().unwrap();
        let backends = self.backends.read().unwrap();
        for (url, entry) in state.iter_mut() {
            if let Some(ejected_at) = entry.ejected_at {
                if ejected_at.elapsed() >= self.spec.ejection_cooldown {
                    entry.ejected_at = None;
                    entry.consecutive_failures = 0;
                    if let Some(backend) = backends.get(url) {
                        backend.mark_healthy();
                    }
                }
            }
        }
    }
}
