// SPDX-License-Identifier: MIT
//! Divergence detection and repair.
//!
//! The task documents say what each work unit's status should be; the ledger
//! says what actually happened. When they disagree, the reconciler classifies
//! the mismatch and, where a corrective event is justified by the event
//! model, emits exactly one. It never invents transitions: only the two
//! mismatch directions below have defined corrective events, everything else
//! is reported for a human.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::board::TaskDoc;
use crate::ledger::{ProjectedState, WuEvent, WuEventKind, WuStatus};
use crate::signal::Signal;

/// `reason` recorded on synthetic corrective events so their origin stays
/// auditable in the ledger.
pub const RECONCILER_REASON: &str = "wud-reconciler";

/// Narrow read/append contracts the reconciler depends on. The production
/// implementation lives in `ops`; tests substitute in-memory fakes.
#[async_trait]
pub trait ReconcilePorts: Send + Sync {
    async fn list_tasks(&self) -> anyhow::Result<Vec<TaskDoc>>;
    async fn list_events(&self) -> anyhow::Result<Vec<WuEvent>>;
    async fn list_signals(&self) -> anyhow::Result<Vec<Signal>>;
    /// Append one event through the normal lock + isolated-transaction path.
    async fn emit_event(&self, event: WuEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnoseOptions {
    /// Emit corrective events for auto-fixable divergences.
    pub fix: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergenceClass {
    /// A corrective event exists and may be emitted.
    AutoFixable,
    /// A signal suggests the transition is still being published; skipped
    /// this pass.
    InFlight,
    /// No defined corrective event; left for manual resolution.
    RequiresHuman,
}

/// One declared-vs-derived mismatch, produced fresh on each pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Divergence {
    pub wu_id: String,
    pub declared: WuStatus,
    pub derived: WuStatus,
    pub class: DivergenceClass,
    /// The corrective event kind, when one is defined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<WuEventKind>,
}

/// Aggregated result of one reconciliation pass. Every divergence is listed,
/// whether or not it was fixed.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseReport {
    pub issues: Vec<Divergence>,
    pub fixed: usize,
}

/// Compare every task document against the event-derived status and repair
/// what can be repaired.
///
/// One corrective event per auto-fixable divergence, and only when
/// `options.fix` is set. Emission failures are logged and counted as
/// unfixed; one task's trouble never aborts the pass.
pub async fn diagnose(
    ports: &dyn ReconcilePorts,
    options: DiagnoseOptions,
) -> anyhow::Result<DiagnoseReport> {
    let docs = ports.list_tasks().await?;
    let events = ports.list_events().await?;
    let signals = ports.list_signals().await?;

    let mut derived_state = ProjectedState::new();
    for event in &events {
        derived_state.apply_event(event);
    }
    let in_flight: HashSet<&str> = signals.iter().map(|s| s.wu_id.as_str()).collect();

    let mut report = DiagnoseReport::default();

    for doc in &docs {
        // A work unit absent from the ledger was never claimed (or its claim
        // was lost): it derives as ready, the available pool.
        let derived = derived_state.status_of(&doc.id).unwrap_or(WuStatus::Ready);
        if derived == doc.status {
            continue;
        }

        if in_flight.contains(doc.id.as_str()) {
            debug!(wu_id = %doc.id, "divergence has a pending signal; skipping this pass");
            report.issues.push(Divergence {
                wu_id: doc.id.clone(),
                declared: doc.status,
                derived,
                class: DivergenceClass::InFlight,
                fix: None,
            });
            continue;
        }

        let fix = corrective_event(doc, derived);
        let class = if fix.is_some() {
            DivergenceClass::AutoFixable
        } else {
            DivergenceClass::RequiresHuman
        };

        if options.fix {
            if let Some(kind) = &fix {
                match ports.emit_event(WuEvent::new(&doc.id, kind.clone())).await {
                    Ok(()) => report.fixed += 1,
                    Err(e) => {
                        warn!(wu_id = %doc.id, err = %e, "corrective event emission failed");
                    }
                }
            }
        }

        report.issues.push(Divergence {
            wu_id: doc.id.clone(),
            declared: doc.status,
            derived,
            class,
            fix,
        });
    }

    Ok(report)
}

/// The two mismatch directions with defined corrective events. Both move the
/// derived state toward the declared one; the documents stay authoritative.
fn corrective_event(doc: &TaskDoc, derived: WuStatus) -> Option<WuEventKind> {
    match (doc.status, derived) {
        // The claim event was lost or never recorded: re-emit it with the
        // document's current lane and title.
        (WuStatus::InProgress, WuStatus::Ready) => Some(WuEventKind::Claim {
            lane: doc.lane.clone(),
            title: doc.title.clone(),
            reason: Some(RECONCILER_REASON.to_string()),
        }),
        // The symmetric case: an orphaned in-progress claim goes back to the
        // pool.
        (WuStatus::Ready, WuStatus::InProgress) => Some(WuEventKind::Release {
            reason: Some(RECONCILER_REASON.to_string()),
        }),
        _ => None,
    }
}
