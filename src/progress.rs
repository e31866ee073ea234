//! The progress channel: ordered, typed events from a running job to any
//! number of subscribers.
//!
//! Events are produced by one worker and fanned out over a broadcast
//! channel. A late subscriber receives a single summary snapshot (the most
//! recent event) plus the live tail, not a full replay. The stream ends at
//! the first terminal event; an HTTP disconnect never cancels the job.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One event on a job's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        step: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    Error {
        step: String,
        message: String,
        reason: String,
    },
    Done {
        step: String,
        message: String,
    },
}

impl ProgressEvent {
    pub fn progress(step: impl Into<String>, message: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            step: step.into(),
            message: message.into(),
            percent: None,
        }
    }

    pub fn progress_percent(
        step: impl Into<String>,
        message: impl Into<String>,
        percent: u8,
    ) -> Self {
        ProgressEvent::Progress {
            step: step.into(),
            message: message.into(),
            percent: Some(percent),
        }
    }

    pub fn error(
        step: impl Into<String>,
        message: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ProgressEvent::Error {
            step: step.into(),
            message: message.into(),
            reason: reason.into(),
        }
    }

    pub fn done(step: impl Into<String>, message: impl Into<String>) -> Self {
        ProgressEvent::Done {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Terminal events close the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. } | ProgressEvent::Done { .. })
    }
}

/// Per-job event fan-out with a snapshot for late subscribers.
pub struct ProgressChannel {
    tx: broadcast::Sender<ProgressEvent>,
    last: Mutex<Option<ProgressEvent>>,
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    /// Emit an event in causal order.
    pub fn emit(&self, event: ProgressEvent) {
        // the lock spans the send so subscribers never observe a gap
        // between their snapshot and the live tail
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(event.clone());
        let _ = self.tx.send(event);
    }

    /// Subscribe: the snapshot summarizing progress so far (if any), plus a
    /// receiver for everything emitted after this call.
    pub fn subscribe(&self) -> (Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let rx = self.tx.subscribe();
        (last.clone(), rx)
    }

    /// Most recent event, if any.
    pub fn snapshot(&self) -> Option<ProgressEvent> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let channel = ProgressChannel::new();
        let (_, mut rx) = channel.subscribe();
        channel.emit(ProgressEvent::progress("tts", "synthesizing"));
        channel.emit(ProgressEvent::progress_percent("tts", "halfway", 50));
        channel.emit(ProgressEvent::done("tts", "finished"));

        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::progress("tts", "synthesizing")
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ProgressEvent::progress_percent("tts", "halfway", 50)
        );
        let last = rx.recv().await.unwrap();
        assert!(last.is_terminal());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_snapshot_not_replay() {
        let channel = ProgressChannel::new();
        channel.emit(ProgressEvent::progress("align", "chunk 1"));
        channel.emit(ProgressEvent::progress("align", "chunk 2"));

        let (snapshot, mut rx) = channel.subscribe();
        assert_eq!(snapshot, Some(ProgressEvent::progress("align", "chunk 2")));

        channel.emit(ProgressEvent::done("align", "ok"));
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent::done("align", "ok"));
    }

    #[test]
    fn test_wire_shape() {
        let json =
            serde_json::to_string(&ProgressEvent::progress_percent("tts", "halfway", 50)).unwrap();
        assert!(json.contains(r#""event":"progress""#));
        assert!(json.contains(r#""percent":50"#));

        let json = serde_json::to_string(&ProgressEvent::progress("tts", "x")).unwrap();
        assert!(!json.contains("percent"));

        let json =
            serde_json::to_string(&ProgressEvent::error("align", "boom", "alignment_diverged"))
                .unwrap();
        assert!(json.contains(r#""reason":"alignment_diverged""#));
    }
}
