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

//! Telemetry module for recording update events

use crate::progress::UpdateEvent;

/// Log an event as a single JSON line
///
/// Fire-and-forget: a serialization failure is logged and otherwise ignored.
pub fn report_event(event: &UpdateEvent) {
    match serde_json::to_string(event) {
        Ok(json) => match event {
            UpdateEvent::Progress { .. } => tracing::debug!("Telemetry event: {json}"),
            _ => tracing::info!("Telemetry event: {json}"),
        },
        Err(e) => tracing::warn!("Failed to serialize telemetry event: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::orchestrator::{FailureReport, Outcome, UpdateState};
    use crate::progress::Operation;
    use crate::version::SemVer;

    #[test]
    fn test_state_changed_serialization() {
        let event = UpdateEvent::StateChanged {
            from: UpdateState::Checking,
            to: UpdateState::UpdateAvailable,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("state_changed"));
        assert!(json.contains("checking"));
        assert!(json.contains("update_available"));
        report_event(&event);
    }

    #[test]
    fn test_installed_serialization() {
        let event = UpdateEvent::Finished {
            operation: Operation::Install,
            outcome: Outcome::Installed {
                version: SemVer::new(1, 3, 0),
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("installed"));
        assert!(json.contains("1.3.0"));
    }

    #[test]
    fn test_failure_serialization() {
        let event = UpdateEvent::Finished {
            operation: Operation::Install,
            outcome: Outcome::Failed(FailureReport {
                kind: ErrorKind::FileRejected,
                message: "file 3 rejected".to_owned(),
                rollback_recommended: true,
            }),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("file_rejected"));
        assert!(json.contains("\"rollback_recommended\":true"));
    }
}
