//! Transition detection - compare the two newest positions against each zone
//!
//! Inside/outside state is not stored; it is recomputed on every pass from
//! the device's two most recent positions:
//! - previous position missing → treated as outside every zone
//! - outside → inside with `alert_on_entry` → ENTERED
//! - inside → outside with `alert_on_exit` → EXITED
//!
//! Zones are independent: one report can trigger several zones in a pass.
//! A zone with invalid geometry is skipped; a store failure aborts the pass.
//!
//! Workers evaluate a range instead: every position captured after the last
//! evaluated one, up to the position that triggered the job, each paired with
//! its predecessor. Reports that queued up behind each other are still
//! classified one window at a time.

use crate::domain::geo::GeoError;
use crate::domain::{DeviceId, Position, Transition, TransitionKind, Zone};
use crate::infra::metrics::Metrics;
use crate::services::containment;
use crate::store::{with_timeout, SpatialStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Positions needed to detect a transition
const WINDOW: usize = 2;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("store failure during evaluation: {0}")]
    Store(#[from] StoreError),
}

/// Apply the transition rule for one zone
#[inline]
pub fn classify(prev_inside: bool, curr_inside: bool, zone: &Zone) -> Option<TransitionKind> {
    if !prev_inside && curr_inside && zone.alert_on_entry {
        Some(TransitionKind::Entered)
    } else if prev_inside && !curr_inside && zone.alert_on_exit {
        Some(TransitionKind::Exited)
    } else {
        None
    }
}

/// Classify a (newest, previous) position pair against one zone
pub fn detect_for_zone(
    zone: &Zone,
    newest: &Position,
    previous: Option<&Position>,
) -> Result<Option<Transition>, GeoError> {
    let curr_inside = containment::contains(zone, newest)?.is_inside;
    let prev_inside = match previous {
        Some(position) => containment::contains(zone, position)?.is_inside,
        None => false,
    };

    Ok(classify(prev_inside, curr_inside, zone).map(|kind| Transition {
        device_id: newest.device_id,
        zone_id: zone.zone_id,
        zone_name: zone.name.clone(),
        kind,
        at: newest.captured_at,
    }))
}

/// Where a range evaluation starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStart {
    /// Capture time of the newest position already evaluated
    After(DateTime<Utc>),
    /// Capture time of the oldest position not yet evaluated; its
    /// predecessor, if any, is looked up
    From(DateTime<Utc>),
}

pub struct TransitionDetector {
    store: Arc<dyn SpatialStore>,
    store_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl TransitionDetector {
    pub fn new(store: Arc<dyn SpatialStore>, store_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self { store, store_timeout, metrics }
    }

    /// Evaluate the device's newest position against every zone
    ///
    /// Returns one transition per zone whose containment changed in an
    /// alerted direction. A device with no positions yields nothing.
    pub async fn evaluate(&self, device_id: DeviceId) -> Result<Vec<Transition>, EvaluationError> {
        let mut positions =
            with_timeout(self.store_timeout, self.store.recent_positions(device_id, WINDOW)).await?;
        positions.reverse();
        let anchored = positions.len() == WINDOW;
        self.evaluate_positions(device_id, &positions, anchored).await
    }

    /// Evaluate every position from `start` up to and including `until`
    ///
    /// Returns the transitions in capture order and the capture time of the
    /// newest position covered, if any.
    pub async fn evaluate_range(
        &self,
        device_id: DeviceId,
        start: RangeStart,
        until: DateTime<Utc>,
    ) -> Result<(Vec<Transition>, Option<DateTime<Utc>>), EvaluationError> {
        let anchor = match start {
            RangeStart::After(after) => Some(after),
            RangeStart::From(from) => {
                let window = self.store.positions_until(device_id, from, WINDOW);
                let window = with_timeout(self.store_timeout, window).await?;
                window.get(1).map(|previous| previous.captured_at)
            }
        };

        // An anchor position comes back first and only serves as a predecessor
        let history = self.store.position_history(device_id, anchor, Some(until));
        let positions = with_timeout(self.store_timeout, history).await?;

        let through = positions.last().map(|p| p.captured_at);
        let transitions = self.evaluate_positions(device_id, &positions, anchor.is_some()).await?;
        Ok((transitions, through))
    }

    /// Classify consecutive positions (oldest first) against every zone
    ///
    /// When `anchored` the first position was evaluated before and only
    /// serves as the predecessor of the second.
    async fn evaluate_positions(
        &self,
        device_id: DeviceId,
        positions: &[Position],
        anchored: bool,
    ) -> Result<Vec<Transition>, EvaluationError> {
        if positions.is_empty() || (anchored && positions.len() < WINDOW) {
            debug!(device_id = %device_id, "geofence_no_positions");
            return Ok(Vec::new());
        }

        let zones = with_timeout(self.store_timeout, self.store.list_zones()).await?;

        let first = usize::from(anchored);
        let mut transitions = Vec::new();
        for idx in first..positions.len() {
            let newest = &positions[idx];
            let previous = idx.checked_sub(1).map(|prev| &positions[prev]);
            self.classify_zones(&zones, newest, previous, &mut transitions);
        }

        Ok(transitions)
    }

    fn classify_zones(
        &self,
        zones: &[Zone],
        newest: &Position,
        previous: Option<&Position>,
        transitions: &mut Vec<Transition>,
    ) {
        for zone in zones {
            match detect_for_zone(zone, newest, previous) {
                Ok(Some(transition)) => {
                    debug!(
                        device_id = %newest.device_id,
                        zone_id = %zone.zone_id,
                        kind = %transition.kind,
                        at = %transition.at.to_rfc3339(),
                        "geofence_transition_detected"
                    );
                    self.metrics.record_transition(transition.kind);
                    transitions.push(transition);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        device_id = %newest.device_id,
                        zone_id = %zone.zone_id,
                        zone = %zone.name,
                        error = %e,
                        "geofence_zone_skipped"
                    );
                    self.metrics.record_zone_error();
                }
            }
        }
    }
}
