//! Run lifecycle tracking and bounded per-run event history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use relay_core::event::{Event, EventType};
use relay_core::ids::{RunId, ThreadId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// One tracked run.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: Map<String, serde_json::Value>,
}

/// Outcome of feeding one event through the tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunTransition {
    /// A run record was created.
    Created,
    /// Lifecycle status changed on an existing run.
    Updated(RunStatus),
    /// No lifecycle effect.
    None,
}

struct HistoryBuffer {
    created_at: DateTime<Utc>,
    events: VecDeque<Event>,
}

pub struct RunTracker {
    runs: DashMap<RunId, Run>,
    history: DashMap<RunId, HistoryBuffer>,
    max_history_size: usize,
    retention_window: Duration,
}

impl RunTracker {
    pub fn new(max_history_size: usize, retention_window: Duration) -> Self {
        Self {
            runs: DashMap::new(),
            history: DashMap::new(),
            max_history_size,
            retention_window,
        }
    }

    /// Apply an event's lifecycle effect.
    ///
    /// `RunStarted` upserts a running record; terminal events stamp the end
    /// of an existing record. Terminal states are absorbing: once a run is
    /// completed or errored, no later event moves it back.
    pub fn observe(&self, event: &Event) -> RunTransition {
        let Some(run_id) = &event.run_id else {
            return RunTransition::None;
        };

        match event.event_type {
            EventType::RunStarted => {
                if self.runs.contains_key(run_id) {
                    return RunTransition::None;
                }
                self.runs.insert(
                    run_id.clone(),
                    Run {
                        run_id: run_id.clone(),
                        thread_id: event.thread_id.clone(),
                        started_at: event.timestamp.unwrap_or_else(Utc::now),
                        status: RunStatus::Running,
                        ended_at: None,
                        error: None,
                        metadata: event.metadata.clone(),
                    },
                );
                RunTransition::Created
            }
            EventType::RunFinished => self.finish(run_id, RunStatus::Completed, None),
            EventType::RunError => self.finish(
                run_id,
                RunStatus::Error,
                event.payload_str("message").map(str::to_owned),
            ),
            _ => RunTransition::None,
        }
    }

    fn finish(&self, run_id: &RunId, status: RunStatus, error: Option<String>) -> RunTransition {
        let Some(mut run) = self.runs.get_mut(run_id) else {
            return RunTransition::None;
        };
        if run.status.is_terminal() {
            return RunTransition::None;
        }
        run.status = status;
        run.ended_at = Some(Utc::now());
        if status == RunStatus::Error {
            run.error = error;
        }
        RunTransition::Updated(status)
    }

    /// Append an event to its run's history buffer, evicting the oldest
    /// entries past the cap.
    pub fn record(&self, event: &Event) {
        let Some(run_id) = &event.run_id else {
            return;
        };
        let mut buffer = self
            .history
            .entry(run_id.clone())
            .or_insert_with(|| HistoryBuffer {
                created_at: Utc::now(),
                events: VecDeque::new(),
            });
        buffer.events.push_back(event.clone());
        while buffer.events.len() > self.max_history_size {
            buffer.events.pop_front();
        }
    }

    pub fn run(&self, run_id: &RunId) -> Option<Run> {
        self.runs.get(run_id).map(|run| run.clone())
    }

    pub fn history(&self, run_id: &RunId) -> Vec<Event> {
        self.history
            .get(run_id)
            .map(|buffer| buffer.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn history_count(&self) -> usize {
        self.history.len()
    }

    /// Purge runs (and their history) older than the retention window.
    /// History buffers for runs that never announced a start age out by
    /// buffer creation time, so memory stays bounded either way.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention_window)
                .unwrap_or_else(|_| chrono::Duration::days(1));

        let expired: Vec<RunId> = self
            .runs
            .iter()
            .filter(|entry| entry.value().started_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for run_id in &expired {
            self.runs.remove(run_id);
            self.history.remove(run_id);
        }

        let orphans: Vec<RunId> = self
            .history
            .iter()
            .filter(|entry| {
                entry.value().created_at < cutoff && !self.runs.contains_key(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for run_id in &orphans {
            self.history.remove(run_id);
        }

        expired.len() + orphans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    const DAY: Duration = Duration::from_millis(86_400_000);

    fn tracker() -> RunTracker {
        RunTracker::new(1000, DAY)
    }

    fn lifecycle_event(event_type: EventType, run: &str) -> Event {
        Event {
            run_id: Some(RunId::from_raw(run)),
            ..Event::new(event_type)
        }
    }

    #[test]
    fn run_started_creates_running_record() {
        let tracker = tracker();
        let transition = tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        assert_eq!(transition, RunTransition::Created);

        let run = tracker.run(&RunId::from_raw("r1")).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn duplicate_run_started_does_not_recreate() {
        let tracker = tracker();
        tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        let transition = tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        assert_eq!(transition, RunTransition::None);
        assert_eq!(tracker.run_count(), 1);
    }

    #[test]
    fn run_finished_completes_and_stamps_end() {
        let tracker = tracker();
        tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        let transition = tracker.observe(&lifecycle_event(EventType::RunFinished, "r1"));
        assert_eq!(transition, RunTransition::Updated(RunStatus::Completed));

        let run = tracker.run(&RunId::from_raw("r1")).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn run_error_records_message() {
        let tracker = tracker();
        tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));

        let mut event = lifecycle_event(EventType::RunError, "r1");
        event
            .payload
            .insert("message".into(), Value::String("pipeline blew up".into()));
        tracker.observe(&event);

        let run = tracker.run(&RunId::from_raw("r1")).unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("pipeline blew up"));
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let tracker = tracker();
        tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        tracker.observe(&lifecycle_event(EventType::RunFinished, "r1"));

        // A stale error event must not regress the completed status.
        let transition = tracker.observe(&lifecycle_event(EventType::RunError, "r1"));
        assert_eq!(transition, RunTransition::None);
        assert_eq!(
            tracker.run(&RunId::from_raw("r1")).unwrap().status,
            RunStatus::Completed
        );
    }

    #[test]
    fn terminal_event_without_start_is_ignored() {
        let tracker = tracker();
        let transition = tracker.observe(&lifecycle_event(EventType::RunFinished, "ghost"));
        assert_eq!(transition, RunTransition::None);
        assert!(tracker.run(&RunId::from_raw("ghost")).is_none());
    }

    #[test]
    fn history_is_capped_fifo() {
        let tracker = RunTracker::new(5, DAY);
        for i in 0..8 {
            let mut event = lifecycle_event(EventType::TextMessageContent, "r1");
            event.delta = Some(json!(i));
            tracker.record(&event);
        }

        let history = tracker.history(&RunId::from_raw("r1"));
        assert_eq!(history.len(), 5);
        // Only the most recent five remain.
        let deltas: Vec<i64> = history
            .iter()
            .map(|e| e.delta.as_ref().unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(deltas, vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn history_for_unknown_run_is_empty() {
        let tracker = tracker();
        assert!(tracker.history(&RunId::from_raw("nope")).is_empty());
    }

    #[test]
    fn events_without_run_id_are_not_recorded() {
        let tracker = tracker();
        tracker.record(&Event::new(EventType::Raw));
        assert_eq!(tracker.history_count(), 0);
    }

    #[test]
    fn sweep_purges_old_runs_and_history() {
        let tracker = RunTracker::new(1000, Duration::from_millis(0));
        tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        tracker.record(&lifecycle_event(EventType::RunStarted, "r1"));
        assert_eq!(tracker.run_count(), 1);
        assert_eq!(tracker.history_count(), 1);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let removed = tracker.sweep();
        assert_eq!(removed, 1);
        assert_eq!(tracker.run_count(), 0);
        assert_eq!(tracker.history_count(), 0);
    }

    #[test]
    fn sweep_keeps_recent_runs() {
        let tracker = tracker();
        tracker.observe(&lifecycle_event(EventType::RunStarted, "r1"));
        assert_eq!(tracker.sweep(), 0);
        assert_eq!(tracker.run_count(), 1);
    }

    #[test]
    fn sweep_ages_out_orphan_history() {
        let tracker = RunTracker::new(1000, Duration::from_millis(0));
        // Events recorded for a run that never announced a start.
        tracker.record(&lifecycle_event(EventType::TextMessageContent, "orphan"));
        assert_eq!(tracker.history_count(), 1);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(tracker.sweep(), 1);
        assert_eq!(tracker.history_count(), 0);
    }
}
