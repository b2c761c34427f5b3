//! Region trigger engine (§4.5) — arms, suppresses, and resets credential
//! presentation exactly-once per region occupancy.
//!
//! Owns the presentation engine by value (an `Arc`-backed clone of its
//! handle) and never holds a reference back to its own owner (§9 Design
//! Note) — the same "owns its collaborator, notifies back by closure"
//! shape as `orchestrator.rs` holding a `Runner` without the `Runner`
//! holding the orchestrator.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::presentation::PresentationEngine;

/// A fixed 128-bit region identifier (§3 Beacon identity constraint).
pub type RegionId = Uuid;

/// Region occupancy (§3). Transitions are driven solely by platform region
/// notifications; `Entered` is authoritative regardless of prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    Inside,
    Outside,
    Unknown,
}

/// The three beacon event kinds consumed (§4.5), each filtered against the
/// configured region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconEvent {
    Entered(RegionId),
    Exited(RegionId),
    StateDetermined(RegionId, Occupancy),
}

/// Drives a [`PresentationEngine`] from beacon region events with
/// exactly-once-per-inside-period semantics.
pub struct RegionTriggerEngine {
    region: RegionId,
    presentation: Arc<PresentationEngine>,
    occupancy: Mutex<Occupancy>,
    guard: Mutex<bool>,
}

impl RegionTriggerEngine {
    pub fn new(region: RegionId, presentation: Arc<PresentationEngine>) -> Self {
        Self {
            region,
            presentation,
            occupancy: Mutex::new(Occupancy::Unknown),
            guard: Mutex::new(false),
        }
    }

    pub async fn occupancy(&self) -> Occupancy {
        *self.occupancy.lock().await
    }

    /// Filters by region identifier (mandatory per §4.5) and dispatches.
    pub async fn handle_event(&self, event: BeaconEvent) {
        let region = match event {
            BeaconEvent::Entered(r) | BeaconEvent::Exited(r) | BeaconEvent::StateDetermined(r, _) => r,
        };
        if region != self.region {
            debug!(?region, configured = ?self.region, "ignoring beacon event for unrelated region");
            return;
        }

        match event {
            BeaconEvent::Entered(_) => self.on_inside().await,
            BeaconEvent::StateDetermined(_, Occupancy::Inside) => self.on_inside().await,
            BeaconEvent::Exited(_) => self.on_outside().await,
            BeaconEvent::StateDetermined(_, Occupancy::Outside) => self.on_outside().await,
            BeaconEvent::StateDetermined(_, Occupancy::Unknown) => {
                *self.occupancy.lock().await = Occupancy::Unknown;
            }
        }
    }

    async fn on_inside(&self) {
        let mut occupancy = self.occupancy.lock().await;
        let was_inside = *occupancy == Occupancy::Inside;
        *occupancy = Occupancy::Inside;
        drop(occupancy);

        // Idempotent w.r.t. duplicate `entered` within a single
        // inside-period: only a *transition into* inside (or the guard
        // being clear) arms a new attempt.
        let mut guard = self.guard.lock().await;
        if was_inside && *guard {
            return;
        }
        if !*guard {
            *guard = true;
            drop(guard);
            info!(region = ?self.region, "region entered — presenting credential");
            self.presentation.present_credential().await;
        }
    }

    async fn on_outside(&self) {
        *self.occupancy.lock().await = Occupancy::Outside;
        *self.guard.lock().await = false;
        info!(region = ?self.region, "region exited — cancelling active presentation");
        self.presentation.cancel().await;
    }

    /// Manual trigger: clears the guard and presents regardless of
    /// occupancy (§4.5).
    pub async fn manual_trigger(&self) {
        *self.guard.lock().await = true;
        info!(region = ?self.region, "manual trigger");
        self.presentation.present_credential().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, EngineConfigOverrides};
    use crate::transport::Transport;

    fn cfg() -> EngineConfig {
        EngineConfig::new(
            Uuid::nil(),
            Uuid::nil(),
            [0u8; 16],
            [1u8; 16],
            "cred".to_string(),
            EngineConfigOverrides {
                scan_timeout_secs: None,
                connection_timeout_secs: None,
                response_timeout_secs: None,
                retry_max: None,
                retry_backoff_secs: None,
                restore_identifier: None,
            },
            None,
        )
    }

    #[tokio::test]
    async fn duplicate_enter_within_inside_period_presents_once() {
        let region = Uuid::new_v4();
        let transport: Arc<dyn Transport> = Arc::new(crate::transport::MockTransport::new());
        let engine = Arc::new(PresentationEngine::new(cfg(), transport, |_| {}));
        let region_engine = RegionTriggerEngine::new(region, engine);

        region_engine.handle_event(BeaconEvent::Entered(region)).await;
        region_engine.handle_event(BeaconEvent::Entered(region)).await;
        region_engine.handle_event(BeaconEvent::Entered(region)).await;

        assert_eq!(region_engine.occupancy().await, Occupancy::Inside);
        assert!(*region_engine.guard.lock().await);
    }

    #[tokio::test]
    async fn enter_exit_enter_presents_twice() {
        let region = Uuid::new_v4();
        let transport: Arc<dyn Transport> = Arc::new(crate::transport::MockTransport::new());
        let engine = Arc::new(PresentationEngine::new(cfg(), transport, |_| {}));
        let region_engine = RegionTriggerEngine::new(region, engine);

        region_engine.handle_event(BeaconEvent::Entered(region)).await;
        assert!(*region_engine.guard.lock().await);

        region_engine.handle_event(BeaconEvent::Exited(region)).await;
        assert_eq!(region_engine.occupancy().await, Occupancy::Outside);
        assert!(!*region_engine.guard.lock().await);

        region_engine.handle_event(BeaconEvent::Entered(region)).await;
        assert_eq!(region_engine.occupancy().await, Occupancy::Inside);
        assert!(*region_engine.guard.lock().await);
    }

    #[tokio::test]
    async fn events_for_other_regions_are_ignored() {
        let region = Uuid::new_v4();
        let other = Uuid::new_v4();
        let transport: Arc<dyn Transport> = Arc::new(crate::transport::MockTransport::new());
        let engine = Arc::new(PresentationEngine::new(cfg(), transport, |_| {}));
        let region_engine = RegionTriggerEngine::new(region, engine);

        region_engine.handle_event(BeaconEvent::Entered(other)).await;
        assert_eq!(region_engine.occupancy().await, Occupancy::Unknown);
    }

    #[tokio::test]
    async fn manual_trigger_presents_regardless_of_occupancy() {
        let region = Uuid::new_v4();
        let transport: Arc<dyn Transport> = Arc::new(crate::transport::MockTransport::new());
        let engine = Arc::new(PresentationEngine::new(cfg(), transport, |_| {}));
        let region_engine = RegionTriggerEngine::new(region, engine);

        region_engine.manual_trigger().await;
        assert!(*region_engine.guard.lock().await);
    }
}
