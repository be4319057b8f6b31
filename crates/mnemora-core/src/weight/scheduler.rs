//! Stateful lifecycle scheduler: the periodic maintenance tick that decays
//! weights, archives qualifying memories, and verifies consistency.

use chrono::Utc;

use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::model::{MemoryPatch, MemoryTier};
use crate::storage::Storage;

use super::algorithm::{self, Factors};

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub decayed: usize,
    pub archived: usize,
    pub consistency_repaired: bool,
}

/// Drives the periodic maintenance tick described by the Weight & Lifecycle
/// component: iterate unarchived memories, apply decay, archive those that
/// qualify, then verify storage/ANN consistency.
pub struct LifecycleScheduler {
    config: LifecycleConfig,
}

impl LifecycleScheduler {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    /// Core never archives regardless of age/weight.
    fn should_archive(&self, age_days: f64, weight: f64, tier: MemoryTier) -> bool {
        tier != MemoryTier::Core
            && age_days >= self.config.archive_age_days as f64
            && weight < self.config.archive_weight_threshold
    }

    pub fn tick(&self, storage: &Storage) -> Result<MaintenanceReport> {
        let now = Utc::now();
        let mut report = MaintenanceReport::default();

        for memory in storage.list_unarchived()? {
            let factors = Factors::from_timestamps(
                memory.created_at,
                memory.last_accessed,
                now,
                false,
                memory.metadata.get("emotional").and_then(|v| v.as_bool()).unwrap_or(false),
            );
            let update = algorithm::apply(memory.weight, factors);
            let should_archive =
                self.should_archive(factors.age_days, update.new_weight, memory.tier());

            storage.update_memory(
                &memory.id,
                &MemoryPatch {
                    weight: Some(update.new_weight),
                    archived: Some(should_archive),
                    ..Default::default()
                },
            )?;
            report.decayed += 1;
            if should_archive {
                report.archived += 1;
            }
        }

        let consistency = storage.check_consistency()?;
        if consistency.orphans_db_only > 0 || consistency.orphans_ann_only > 0 {
            storage.repair_consistency()?;
            report.consistency_repaired = true;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tier_is_never_archived() {
        let scheduler = LifecycleScheduler::new(LifecycleConfig::default());
        assert!(!scheduler.should_archive(9999.0, 0.1, MemoryTier::Core));
    }

    #[test]
    fn stale_low_weight_memory_qualifies_for_archival() {
        let scheduler = LifecycleScheduler::new(LifecycleConfig::default());
        assert!(scheduler.should_archive(31.0, 1.0, MemoryTier::ShortTerm));
    }

    #[test]
    fn recent_low_weight_memory_is_not_archived() {
        let scheduler = LifecycleScheduler::new(LifecycleConfig::default());
        assert!(!scheduler.should_archive(1.0, 1.0, MemoryTier::ShortTerm));
    }
}
