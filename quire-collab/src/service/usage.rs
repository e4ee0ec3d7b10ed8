//! Best-effort template usage bumps.
//!
//! ```text
//! create_document_from_template ──► UsageRecorder::record() ──► mpsc ──► worker ──► store
//!            │                                (never blocks, never fails the caller)
//!            ▼
//!      Ok(document id)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use quire_core::model::{now_millis, TemplateId};
use quire_core::template::Template;

use super::ServiceError;
use crate::storage::RecordStore;

/// One queued usage bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageBump {
    pub template_id: TemplateId,
    pub used_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageStats {
    pub queued: u64,
    pub applied: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicUsageStats {
    queued: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
}

/// Sending half of the usage side channel. Cheap to clone.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<UsageBump>,
    stats: Arc<AtomicUsageStats>,
}

impl UsageRecorder {
    /// Spawn a worker applying bumps with `apply`.
    pub fn spawn<F>(apply: F) -> (Self, JoinHandle<()>)
    where
        F: Fn(UsageBump) -> Result<(), ServiceError> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsageBump>();
        let stats = Arc::new(AtomicUsageStats::default());
        let worker_stats = Arc::clone(&stats);

        let worker = tokio::spawn(async move {
            while let Some(bump) = rx.recv().await {
                match apply(bump) {
                    Ok(()) => {
                        worker_stats.applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        worker_stats.failed.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Usage bump for template {} failed: {e}", bump.template_id);
                    }
                }
            }
            log::debug!("Usage worker stopped");
        });

        (Self { tx, stats }, worker)
    }

    /// Worker bumping templates in `store`.
    pub fn for_store<S: RecordStore + 'static>(store: Arc<S>) -> (Self, JoinHandle<()>) {
        Self::spawn(move |bump| apply_bump(store.as_ref(), bump))
    }

    /// Queue a bump. Failure to queue is logged and swallowed.
    pub fn record(&self, template_id: TemplateId) {
        let bump = UsageBump {
            template_id,
            used_at: now_millis(),
        };
        match self.tx.send(bump) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Usage worker gone; dropped bump for template {template_id}");
            }
        }
    }

    pub fn stats(&self) -> UsageStats {
        UsageStats {
            queued: self.stats.queued.load(Ordering::Relaxed),
            applied: self.stats.applied.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

/// Read-modify-write of the usage counters.
pub fn apply_bump<S: RecordStore>(store: &S, bump: UsageBump) -> Result<(), ServiceError> {
    let updated = store
        .patch::<Template, _>(bump.template_id, |template| template.record_usage(bump.used_at))?;
    match updated {
        Some(_) => Ok(()),
        None => Err(ServiceError::not_found("template", bump.template_id)),
    }
}
