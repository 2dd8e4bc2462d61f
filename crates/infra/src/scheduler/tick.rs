//! One scheduler tick: fire every due schedule entry.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{error, info, warn};

use firstsip_core::ScheduleEntry;

use super::cache::ScheduleCache;
use super::cron::{parse_timezone, validate_cron_expression, CronEvaluator};
use super::source::{ScheduleSource, SourceError};
use crate::jobs::client::ExecutionEnqueuer;

/// Per-tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub total: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub errored: usize,
}

pub struct SchedulerTick<Src, C, E> {
    source: Src,
    cache: C,
    enqueuer: E,
    evaluator: CronEvaluator,
}

enum EntryOutcome {
    Enqueued,
    Skipped,
    Errored,
}

impl<Src, C, E> SchedulerTick<Src, C, E>
where
    Src: ScheduleSource,
    C: ScheduleCache,
    E: ExecutionEnqueuer,
{
    pub fn new(source: Src, cache: C, enqueuer: E, evaluator: CronEvaluator) -> Self {
        Self {
            source,
            cache,
            enqueuer,
            evaluator,
        }
    }

    /// Evaluate every schedulable entry at `now`.
    ///
    /// Only a failure to load entries fails the tick; per-entry problems are
    /// logged and counted.
    pub fn run(&self, now: DateTime<Utc>) -> Result<TickSummary, SourceError> {
        let entries = self.source.load_schedulable()?;
        let mut summary = TickSummary {
            total: entries.len(),
            ..Default::default()
        };

        for entry in &entries {
            match self.fire_if_due(entry, now) {
                EntryOutcome::Enqueued => summary.enqueued += 1,
                EntryOutcome::Skipped => summary.skipped += 1,
                EntryOutcome::Errored => summary.errored += 1,
            }
        }

        info!(
            total = summary.total,
            enqueued = summary.enqueued,
            skipped = summary.skipped,
            errored = summary.errored,
            "scheduler tick complete"
        );
        Ok(summary)
    }

    fn fire_if_due(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> EntryOutcome {
        let owner_id = entry.owner_id;
        let target_id = entry.target_id;

        // Broken expressions are rejected before any cache round trip.
        if let Err(e) = validate_cron_expression(&entry.cron_expr) {
            warn!(
                %owner_id,
                %target_id,
                cron_expr = %entry.cron_expr,
                error = %e,
                "invalid cron expression; skipping"
            );
            return EntryOutcome::Errored;
        }

        let tz = match parse_timezone(&entry.timezone) {
            Ok(tz) => tz,
            Err(e) => {
                if !entry.timezone.trim().is_empty() {
                    warn!(%owner_id, %target_id, error = %e, "invalid timezone, falling back to UTC");
                }
                Tz::UTC
            }
        };

        let last_run = self.cache.last_run(owner_id, target_id).unwrap_or_else(|e| {
            warn!(%owner_id, %target_id, error = %e, "schedule cache read failed; treating as cold");
            None
        });

        match self.evaluator.due(&entry.cron_expr, tz, last_run, now) {
            Ok(true) => {}
            Ok(false) => return EntryOutcome::Skipped,
            Err(e) => {
                warn!(
                    %owner_id,
                    %target_id,
                    cron_expr = %entry.cron_expr,
                    error = %e,
                    "failed to evaluate cron expression; skipping"
                );
                return EntryOutcome::Errored;
            }
        }

        match self
            .enqueuer
            .enqueue_execute(target_id, owner_id, &entry.target_name, entry.settings.clone())
        {
            Ok(outcome) => {
                if let Err(e) = self.cache.set_last_run(owner_id, target_id, now) {
                    warn!(%owner_id, %target_id, error = %e, "failed to record last run");
                }
                info!(
                    %owner_id,
                    %target_id,
                    target_name = %entry.target_name,
                    cron_expr = %entry.cron_expr,
                    timezone = %tz,
                    duplicate = outcome.is_duplicate(),
                    "enqueued scheduled execution"
                );
                EntryOutcome::Enqueued
            }
            Err(e) => {
                error!(
                    %owner_id,
                    %target_id,
                    target_name = %entry.target_name,
                    error = %e,
                    "failed to enqueue scheduled execution"
                );
                EntryOutcome::Errored
            }
        }
    }
}

impl<Src, C, E> std::fmt::Debug for SchedulerTick<Src, C, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerTick")
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use firstsip_core::{OwnerId, Settings, TargetId};

    use crate::jobs::client::EnqueueError;
    use crate::jobs::store::JobStoreError;
    use crate::jobs::types::{EnqueueOutcome, JobId};
    use crate::scheduler::cache::InMemoryScheduleCache;
    use crate::scheduler::source::InMemoryScheduleSource;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(TargetId, String)>>,
        fail_target: Option<TargetId>,
    }

    impl ExecutionEnqueuer for Recorder {
        fn enqueue_execute(
            &self,
            target_id: TargetId,
            _owner_id: OwnerId,
            target_name: &str,
            _settings: Settings,
        ) -> Result<EnqueueOutcome, EnqueueError> {
            if self.fail_target == Some(target_id) {
                return Err(EnqueueError::Store(JobStoreError::Storage("broker down".into())));
            }
            self.calls.lock().unwrap().push((target_id, target_name.to_string()));
            Ok(EnqueueOutcome::Accepted(JobId::new()))
        }
    }

    fn entry(target: u64, cron: &str, tz: &str) -> ScheduleEntry {
        ScheduleEntry {
            owner_id: OwnerId::new(1),
            target_id: TargetId::new(target),
            target_name: format!("plugin-{target}"),
            cron_expr: cron.into(),
            timezone: tz.into(),
            enabled: true,
            settings: Settings::new(),
        }
    }

    fn at_nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 19, 9, 0, 10).unwrap()
    }

    fn tick(
        entries: Vec<ScheduleEntry>,
        recorder: Arc<Recorder>,
        cache: Arc<InMemoryScheduleCache>,
    ) -> SchedulerTick<InMemoryScheduleSource, Arc<InMemoryScheduleCache>, Arc<Recorder>> {
        SchedulerTick::new(
            InMemoryScheduleSource::with_entries(entries),
            cache,
            recorder,
            CronEvaluator::default(),
        )
    }

    #[test]
    fn malformed_cron_does_not_stop_the_tick() {
        let recorder = Arc::new(Recorder::default());
        let cache = Arc::new(InMemoryScheduleCache::new());
        let t = tick(
            vec![
                entry(1, "0 9 * * *", "UTC"),
                entry(2, "not a cron", "UTC"),
                entry(3, "0 9 * * *", "UTC"),
                entry(4, "30 9 * * *", "UTC"),
            ],
            recorder.clone(),
            cache.clone(),
        );

        let summary = t.run(at_nine()).unwrap();

        assert_eq!(
            summary,
            TickSummary {
                total: 4,
                enqueued: 2,
                skipped: 1,
                errored: 1
            }
        );
        let fired: Vec<u64> = recorder.calls.lock().unwrap().iter().map(|(t, _)| t.get()).collect();
        assert_eq!(fired, vec![1, 3]);
        assert_eq!(
            cache.last_run(OwnerId::new(1), TargetId::new(1)).unwrap(),
            DateTime::from_timestamp(at_nine().timestamp(), 0)
        );
    }

    /// Counts cache reads.
    #[derive(Default)]
    struct CountingCache {
        inner: InMemoryScheduleCache,
        reads: std::sync::atomic::AtomicUsize,
    }

    impl ScheduleCache for CountingCache {
        fn last_run(
            &self,
            owner_id: OwnerId,
            target_id: TargetId,
        ) -> Result<Option<DateTime<Utc>>, crate::scheduler::cache::CacheError> {
            self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.last_run(owner_id, target_id)
        }

        fn set_last_run(
            &self,
            owner_id: OwnerId,
            target_id: TargetId,
            at: DateTime<Utc>,
        ) -> Result<(), crate::scheduler::cache::CacheError> {
            self.inner.set_last_run(owner_id, target_id, at)
        }
    }

    #[test]
    fn malformed_cron_is_rejected_before_reading_the_cache() {
        let recorder = Arc::new(Recorder::default());
        let cache = Arc::new(CountingCache::default());
        let t = SchedulerTick::new(
            InMemoryScheduleSource::with_entries(vec![
                entry(1, "0 9 * *", "UTC"),
                entry(2, "0 9 * * *", "UTC"),
            ]),
            cache.clone(),
            recorder,
            CronEvaluator::default(),
        );

        let summary = t.run(at_nine()).unwrap();
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(cache.reads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn second_tick_in_the_same_minute_does_not_refire() {
        let recorder = Arc::new(Recorder::default());
        let cache = Arc::new(InMemoryScheduleCache::new());
        let t = tick(vec![entry(1, "0 9 * * *", "UTC")], recorder.clone(), cache);

        assert_eq!(t.run(at_nine()).unwrap().enqueued, 1);
        let later = at_nine() + chrono::Duration::seconds(30);
        assert_eq!(t.run(later).unwrap().enqueued, 0);
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let recorder = Arc::new(Recorder::default());
        let t = tick(
            vec![entry(1, "0 9 * * *", "Nowhere/Special"), entry(2, "0 9 * * *", "")],
            recorder.clone(),
            Arc::new(InMemoryScheduleCache::new()),
        );
        assert_eq!(t.run(at_nine()).unwrap().enqueued, 2);
    }

    #[test]
    fn enqueue_failure_is_counted_and_cache_untouched() {
        let recorder = Arc::new(Recorder {
            fail_target: Some(TargetId::new(1)),
            ..Default::default()
        });
        let cache = Arc::new(InMemoryScheduleCache::new());
        let t = tick(vec![entry(1, "0 9 * * *", "UTC")], recorder, cache.clone());

        assert_eq!(t.run(at_nine()).unwrap().errored, 1);
        assert_eq!(cache.last_run(OwnerId::new(1), TargetId::new(1)).unwrap(), None);
    }

    #[test]
    fn corrupt_cache_value_is_treated_as_cold() {
        let recorder = Arc::new(Recorder::default());
        let cache = Arc::new(InMemoryScheduleCache::new());
        cache.insert_raw("1:1", "garbage");
        let t = tick(vec![entry(1, "0 9 * * *", "UTC")], recorder, cache);

        assert_eq!(t.run(at_nine()).unwrap().enqueued, 1);
    }
}
