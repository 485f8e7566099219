//! Loading Tracker (C3).
//!
//! Owns the single current loading-progress record and fans it out to subscribers via a
//! bounded broadcast channel, matching the teacher's SSE-streaming shape (`api/chat.rs`'s
//! `chat_completion_stream`) generalized from token chunks to progress snapshots. Also holds
//! per-model usage history for ETA estimation and predictive warming.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;
/// Consider a model "frequently used" for predictive prewarm purposes above this count within
/// the last 24h.
const PREDICTIVE_PREWARM_THRESHOLD: u32 = 3;
const PREDICTIVE_PREWARM_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Phase of the current (or most recent) load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Unloading,
    Starting,
    Loading,
    Warmup,
    Ready,
    Failed,
}

/// A single progress snapshot, published to subscribers on every phase change.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub model_id: String,
    pub phase: Phase,
    pub percent: u8,
    pub message: String,
    #[serde(skip)]
    pub started_at: Instant,
    pub elapsed_ms: u64,
    pub estimated_total_ms: u64,
    pub is_warm: bool,
    pub size_mb: u64,
    pub error: Option<String>,
}

impl Progress {
    fn idle() -> Self {
        Self {
            model_id: String::new(),
            phase: Phase::Idle,
            percent: 0,
            message: String::new(),
            started_at: Instant::now(),
            elapsed_ms: 0,
            estimated_total_ms: 0,
            is_warm: false,
            size_mb: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct UsageRecord {
    last_used_at: Option<Instant>,
    use_count: u32,
    recent_load_times: Vec<Duration>,
    recent_uses: Vec<Instant>,
}

struct TrackerState {
    current: Progress,
    usage: HashMap<String, UsageRecord>,
}

/// Loading Tracker shared across the process.
pub struct LoadingTracker {
    state: Mutex<TrackerState>,
    publisher: broadcast::Sender<Progress>,
}

impl LoadingTracker {
    pub fn new() -> Self {
        let (publisher, _rx) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(TrackerState { current: Progress::idle(), usage: HashMap::new() }),
            publisher,
        }
    }

    /// Begin tracking a new load. Resets the current record.
    pub fn start(&self, model_id: &str, size_mb: u64, is_warm: bool) {
        let mut state = self.state.lock().unwrap();
        state.current = Progress {
            model_id: model_id.to_string(),
            phase: Phase::Starting,
            percent: 0,
            message: "starting worker process".to_string(),
            started_at: Instant::now(),
            elapsed_ms: 0,
            estimated_total_ms: self.estimate_total_ms(&state.usage, model_id, size_mb, is_warm),
            is_warm,
            size_mb,
            error: None,
        };
        self.publish(&state.current);
    }

    /// Advance the phase/percent of the in-flight load. Percent is clamped to be
    /// non-decreasing within a single load (spec invariant, §3).
    pub fn update_phase(&self, phase: Phase, percent: u8, message: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let clamped = percent.max(state.current.percent).min(100);
        state.current.phase = phase;
        state.current.percent = clamped;
        state.current.message = message.into();
        state.current.elapsed_ms = state.current.started_at.elapsed().as_millis() as u64;
        self.publish(&state.current);
    }

    /// Asymptotic progress shaping for the `loading` phase (spec §4.3):
    /// `40 + 55 * (1 - e^(-elapsed_secs/60))`, so it approaches but never reaches 95% while
    /// the load is still in flight.
    pub fn update_loading_progress(&self, message: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        let elapsed_secs = state.current.started_at.elapsed().as_secs_f64();
        let shaped = 40.0 + 55.0 * (1.0 - (-elapsed_secs / 60.0).exp());
        let percent = (shaped.floor() as u8).clamp(state.current.percent, 95);

        state.current.phase = Phase::Loading;
        state.current.percent = percent;
        state.current.message = message.into();
        state.current.elapsed_ms = state.current.started_at.elapsed().as_millis() as u64;
        self.publish(&state.current);
    }

    /// Complete the in-flight load, success or failure.
    pub fn complete(&self, success: bool, error_message: Option<String>) {
        let mut state = self.state.lock().unwrap();
        let model_id = state.current.model_id.clone();
        let load_duration = state.current.started_at.elapsed();

        if success {
            state.current.phase = Phase::Ready;
            state.current.percent = 100;
            state.current.message = "ready".to_string();
            state.current.error = None;

            let record = state.usage.entry(model_id).or_default();
            record.last_used_at = Some(Instant::now());
            record.use_count += 1;
            record.recent_load_times.push(load_duration);
            if record.recent_load_times.len() > 5 {
                record.recent_load_times.remove(0);
            }
            record.recent_uses.push(Instant::now());
        } else {
            state.current.phase = Phase::Failed;
            state.current.message = error_message.clone().unwrap_or_default();
            state.current.error = error_message;
        }
        state.current.elapsed_ms = state.current.started_at.elapsed().as_millis() as u64;
        self.publish(&state.current);
    }

    pub fn get_progress(&self) -> Progress {
        self.state.lock().unwrap().current.clone()
    }

    /// Subscribe to progress updates. A lagging receiver (one that falls more than
    /// `SUBSCRIBER_CHANNEL_CAPACITY` updates behind) observes `RecvError::Lagged` and should
    /// resynchronize via `get_progress()` rather than replay the gap.
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.publisher.subscribe()
    }

    /// Models used >= 3 times within the last 24h, excluding `current_id`.
    pub fn should_prewarm(&self, current_id: &str) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .usage
            .iter_mut()
            .filter(|(id, _)| id.as_str() != current_id)
            .filter_map(|(id, record)| {
                record.recent_uses.retain(|t| now.duration_since(*t) <= PREDICTIVE_PREWARM_WINDOW);
                if record.recent_uses.len() as u32 >= PREDICTIVE_PREWARM_THRESHOLD {
                    Some(id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// The `n` most recently used model ids, most recent first.
    pub fn recent_models(&self, n: usize) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<_> = state
            .usage
            .iter()
            .filter_map(|(id, r)| r.last_used_at.map(|t| (id.clone(), t)))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().take(n).map(|(id, _)| id).collect()
    }

    fn estimate_total_ms(
        &self,
        usage: &HashMap<String, UsageRecord>,
        model_id: &str,
        size_mb: u64,
        is_warm: bool,
    ) -> u64 {
        if let Some(record) = usage.get(model_id)
            && !record.recent_load_times.is_empty()
        {
            let total: Duration = record.recent_load_times.iter().sum();
            return (total.as_millis() / record.recent_load_times.len() as u128) as u64;
        }
        let per_mb_ms = if is_warm { 5 } else { 25 };
        size_mb * per_mb_ms
    }

    fn publish(&self, progress: &Progress) {
        // A broadcast channel with no subscribers errors on send; that's expected and ignored.
        let _ = self.publisher.send(progress.clone());
    }
}

impl Default for LoadingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_monotonic_within_load() {
        let tracker = LoadingTracker::new();
        tracker.start("llama-3-8b", 4096, false);
        tracker.update_phase(Phase::Loading, 40, "loading");
        tracker.update_phase(Phase::Loading, 30, "should not regress");
        assert_eq!(tracker.get_progress().percent, 40);
    }

    #[test]
    fn test_complete_success_sets_100_percent() {
        let tracker = LoadingTracker::new();
        tracker.start("llama-3-8b", 4096, false);
        tracker.update_phase(Phase::Loading, 80, "loading");
        tracker.complete(true, None);
        let progress = tracker.get_progress();
        assert_eq!(progress.percent, 100);
        assert_eq!(progress.phase, Phase::Ready);
    }

    #[test]
    fn test_complete_failure_preserves_percent() {
        let tracker = LoadingTracker::new();
        tracker.start("llama-3-8b", 4096, false);
        tracker.update_phase(Phase::Loading, 55, "loading");
        tracker.complete(false, Some("worker exited".to_string()));
        let progress = tracker.get_progress();
        assert_eq!(progress.percent, 55);
        assert_eq!(progress.phase, Phase::Failed);
        assert_eq!(progress.error.as_deref(), Some("worker exited"));
    }

    #[test]
    fn test_should_prewarm_requires_three_uses() {
        let tracker = LoadingTracker::new();
        for _ in 0..3 {
            tracker.start("model-b", 1024, true);
            tracker.complete(true, None);
        }
        tracker.start("model-a", 1024, true);
        tracker.complete(true, None);

        let candidates = tracker.should_prewarm("model-a");
        assert!(candidates.contains(&"model-b".to_string()));
        assert!(!candidates.contains(&"model-a".to_string()));
    }

    #[test]
    fn test_asymptotic_shaping_never_exceeds_95() {
        let tracker = LoadingTracker::new();
        tracker.start("m", 1024, false);
        // Directly exercise the shaping formula at a far-future elapsed time.
        std::thread::sleep(Duration::from_millis(5));
        tracker.update_loading_progress("still loading");
        let progress = tracker.get_progress();
        assert!(progress.percent <= 95);
        assert!(progress.percent >= 40);
    }
}
