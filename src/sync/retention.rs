//! Policy-driven removal of aged local copies.

use crate::config::{RetentionConfig, RetentionPolicy};
use crate::db::models::EventCategory;
use crate::db::repositories::EventStore;
use crate::error::Result;
use crate::messaging::EventNotifier;
use crate::db::models::Event;
use crate::stores::ArchiveStore;
use crate::sync::archive_path;
use crate::sync::clock::Clock;
use crate::sync::deletion::DeletionCoordinator;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepState {
    Idle,
    Scanning,
    Purging,
}

/// Outcome of one category within a sweep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorySweep {
    pub category: EventCategory,
    pub cutoff: DateTime<Utc>,
    pub eligible: usize,
    pub purged: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Enabled categories only
    pub categories: Vec<CategorySweep>,
}

impl SweepReport {
    pub fn purged(&self) -> usize {
        self.categories.iter().map(|c| c.purged).sum()
    }

    pub fn failed(&self) -> usize {
        self.categories.iter().map(|c| c.failed).sum()
    }
}

/// What a sweep would remove right now
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionPreview {
    pub category: EventCategory,
    pub enabled: bool,
    pub retention_days: i64,
    pub cutoff: DateTime<Utc>,
    /// Always zero for a disabled category
    pub eligible: usize,
}

/// Clears the running flag when a sweep ends, however it ends
struct SweepGuard<'a> {
    sweeper: &'a RetentionSweeper,
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.sweeper.set_state(SweepState::Idle);
        self.sweeper.running.store(false, Ordering::SeqCst);
    }
}

pub struct RetentionSweeper {
    config: RetentionConfig,
    store: Arc<dyn EventStore>,
    deletion: Arc<DeletionCoordinator>,
    archive: Arc<dyn ArchiveStore>,
    clock: Arc<dyn Clock>,
    notifier: EventNotifier,
    running: AtomicBool,
    state: Mutex<SweepState>,
}

impl RetentionSweeper {
    pub fn new(
        config: RetentionConfig,
        store: Arc<dyn EventStore>,
        deletion: Arc<DeletionCoordinator>,
        archive: Arc<dyn ArchiveStore>,
        clock: Arc<dyn Clock>,
        notifier: EventNotifier,
    ) -> Self {
        Self {
            config,
            store,
            deletion,
            archive,
            clock,
            notifier,
            running: AtomicBool::new(false),
            state: Mutex::new(SweepState::Idle),
        }
    }

    pub fn policy_for(&self, category: EventCategory) -> RetentionPolicy {
        match category {
            EventCategory::Event => self.config.events,
            EventCategory::Snapshot => self.config.snapshots,
        }
    }

    pub fn state(&self) -> SweepState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SweepState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Events triggered at or before the cutoff are eligible
    fn cutoff(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(policy.retention_days)
    }

    /// Aged events that still have a file in the archive. Existence is read
    /// from the archive itself, not from the recorded path.
    async fn aged_local_copies(
        &self,
        category: EventCategory,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let mut with_copy = Vec::new();
        for event in self.store.retention_candidates(category, cutoff).await? {
            let Some(path) = archive_path(self.archive.as_ref(), &event) else {
                continue;
            };
            match self.archive.size_of(&path).await {
                Ok(Some(_)) => with_copy.push(event),
                Ok(None) if event.local_path.is_some() => {
                    // Stale record; deleting clears it
                    with_copy.push(event)
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Cannot check archive copy of event {}: {}", event.id, e);
                    with_copy.push(event);
                }
            }
        }
        Ok(with_copy)
    }

    /// Run one pass. Returns `None` without doing anything when a pass is
    /// already running.
    pub async fn sweep(&self) -> Result<Option<SweepReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Retention sweep already in progress, skipping this tick");
            return Ok(None);
        }
        let _guard = SweepGuard { sweeper: self };

        let started_at = self.clock.now();
        info!("Retention sweep started");
        self.notifier.sweep_started().await;

        let mut categories = Vec::new();
        for category in EventCategory::ALL {
            let policy = self.policy_for(category);
            if !policy.enabled {
                debug!("Retention for {} is disabled, skipping", category);
                continue;
            }
            categories.push(self.sweep_category(category, &policy, started_at).await?);
        }

        let report = SweepReport {
            started_at,
            finished_at: self.clock.now(),
            categories,
        };
        info!(
            "Retention sweep completed: {} purged, {} failed",
            report.purged(),
            report.failed()
        );
        self.notifier.sweep_completed(&report).await;

        Ok(Some(report))
    }

    async fn sweep_category(
        &self,
        category: EventCategory,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<CategorySweep> {
        self.set_state(SweepState::Scanning);
        let cutoff = self.cutoff(policy, now);
        let candidates = self.aged_local_copies(category, cutoff).await?;
        debug!(
            "{} {} events triggered at or before {}",
            candidates.len(),
            category,
            cutoff
        );

        self.set_state(SweepState::Purging);
        let mut purged = 0;
        let mut failed = 0;
        for event in &candidates {
            match self.deletion.delete_local(&event.id).await {
                Ok(deletion) => {
                    purged += 1;
                    self.notifier
                        .deleted_local(event.id, deletion.removed_file)
                        .await;
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        "Retention failed to delete local copy of event {}: {}",
                        event.id, e
                    );
                }
            }
        }

        if purged > 0 {
            info!(
                "Removed {} local {} copies older than {} days",
                purged, category, policy.retention_days
            );
        }

        Ok(CategorySweep {
            category,
            cutoff,
            eligible: candidates.len(),
            purged,
            failed,
        })
    }

    /// Per-category counts of what the next sweep would remove
    pub async fn preview(&self) -> Result<Vec<RetentionPreview>> {
        let now = self.clock.now();
        let mut previews = Vec::new();
        for category in EventCategory::ALL {
            let policy = self.policy_for(category);
            let cutoff = self.cutoff(&policy, now);
            let eligible = if policy.enabled {
                self.aged_local_copies(category, cutoff).await?.len()
            } else {
                0
            };
            previews.push(RetentionPreview {
                category,
                enabled: policy.enabled,
                retention_days: policy.retention_days,
                cutoff,
                eligible,
            });
        }
        Ok(previews)
    }
}
