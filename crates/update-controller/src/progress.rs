// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Update Controller.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Progress and status events published to the presentation layer

use crate::orchestrator::{Outcome, UpdateState};
use crate::telemetry::report_event;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Check,
    Install,
    Rollback,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Check => "check",
            Self::Install => "install",
            Self::Rollback => "rollback",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpdateEvent {
    Progress {
        operation: Operation,
        percent: u8,
        message: String,
    },
    StateChanged {
        from: UpdateState,
        to: UpdateState,
    },
    Finished {
        operation: Operation,
        outcome: Outcome,
    },
}

/// Where events go; a closed receiver just drops them
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<UpdateEvent>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<UpdateEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: UpdateEvent) {
        report_event(&event);
        let _ = self.tx.send(event);
    }

    pub fn reporter(&self, operation: Operation) -> ProgressReporter {
        ProgressReporter {
            operation,
            sink: self.clone(),
            last: Arc::new(AtomicU8::new(0)),
        }
    }
}

/// Progress for a single operation, never decreasing
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    operation: Operation,
    sink: EventSink,
    last: Arc<AtomicU8>,
}

impl ProgressReporter {
    /// Emit a milestone; a value below the previous one is raised to it
    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let percent = percent.min(100);
        let previous = self.last.fetch_max(percent, Ordering::AcqRel);
        self.sink.emit(UpdateEvent::Progress {
            operation: self.operation,
            percent: percent.max(previous),
            message: message.into(),
        });
    }

    /// Map `done / total` into `start..=end`, emitting only when the percentage grows
    pub fn track(&self, start: u8, end: u8, done: u64, total: u64, message: &str) {
        let Some(percent) = scale(start, end, done, total) else {
            return;
        };
        if self.last.fetch_max(percent, Ordering::AcqRel) < percent {
            self.sink.emit(UpdateEvent::Progress {
                operation: self.operation,
                percent,
                message: message.to_owned(),
            });
        }
    }

    pub fn current(&self) -> u8 {
        self.last.load(Ordering::Acquire)
    }
}

fn scale(start: u8, end: u8, done: u64, total: u64) -> Option<u8> {
    if total == 0 || end < start {
        return None;
    }
    let span = u64::from(end - start);
    let offset = span * done.min(total) / total;
    u8::try_from(u64::from(start) + offset).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn percents(rx: &mut mpsc::UnboundedReceiver<UpdateEvent>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let UpdateEvent::Progress { percent, .. } = event {
                out.push(percent);
            }
        }
        out
    }

    #[test]
    fn test_scale() {
        assert_eq!(scale(10, 50, 0, 100), Some(10));
        assert_eq!(scale(10, 50, 50, 100), Some(30));
        assert_eq!(scale(10, 50, 100, 100), Some(50));
        assert_eq!(scale(10, 50, 500, 100), Some(50));
        assert_eq!(scale(0, 100, 3, 5), Some(60));
        assert_eq!(scale(10, 50, 1, 0), None);
    }

    #[test]
    fn test_report_never_decreases() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = EventSink::new(tx).reporter(Operation::Check);

        reporter.report(0, "start");
        reporter.report(50, "half");
        reporter.report(30, "late chunk");
        reporter.report(120, "done");

        assert_eq!(percents(&mut rx), vec![0, 50, 50, 100]);
        assert_eq!(reporter.current(), 100);
    }

    #[test]
    fn test_track_skips_repeats() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = EventSink::new(tx).reporter(Operation::Install);

        for done in [0, 1, 1, 2, 2, 3] {
            reporter.track(0, 100, done, 3, "file");
        }
        assert_eq!(percents(&mut rx), vec![33, 66, 100]);
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let reporter = EventSink::new(tx).reporter(Operation::Rollback);
        reporter.report(10, "still fine");
        assert_eq!(reporter.current(), 10);
    }

    #[test]
    fn test_event_serialization() {
        let event = UpdateEvent::Progress {
            operation: Operation::Install,
            percent: 40,
            message: "Installed 2/5 files".to_owned(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"progress\""));
        assert!(json.contains("\"operation\":\"install\""));
        assert!(json.contains("40"));
    }
}
