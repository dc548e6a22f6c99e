//! Notice ingestion: the only path that writes to the registry.
//!
//! Telemetry samples repeat a notice for as long as the provider keeps
//! it up, so each `(instance, notice id)` pair is reported once.

use std::sync::Arc;

use tracing::debug;

use spotgrid_core::Telemetry;
use spotgrid_state::{RiskEventType, StateResult};

use crate::registry::{PoisonTransition, RiskRegistry};

/// A notice that reached the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedNotice {
    pub notice_id: String,
    pub kind: RiskEventType,
    pub transition: PoisonTransition,
}

#[derive(Clone)]
pub struct NoticeIngestor {
    registry: Arc<RiskRegistry>,
}

impl NoticeIngestor {
    pub fn new(registry: Arc<RiskRegistry>) -> Self {
        Self { registry }
    }

    /// Report every notice in the sample not seen before. A notice
    /// counts as seen only once its event is in the log, so a failed
    /// append is retried by the next sample carrying it.
    pub fn ingest(&self, telemetry: &Telemetry) -> StateResult<Vec<IngestedNotice>> {
        let mut reported = Vec::new();
        for notice in &telemetry.notices {
            let Some(transition) = self.registry.report_notice(
                &telemetry.current_pool,
                notice.kind,
                &telemetry.tenant_id,
                &telemetry.instance_id,
                &notice.id,
            )?
            else {
                debug!(
                    instance = %telemetry.instance_id,
                    notice = %notice.id,
                    "notice already reported"
                );
                continue;
            };
            reported.push(IngestedNotice {
                notice_id: notice.id.clone(),
                kind: notice.kind,
                transition,
            });
        }
        Ok(reported)
    }
}
