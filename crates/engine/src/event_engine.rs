//! `EventEngine` (spec §4.3): periodic polling of due events, batch
//! selection with strict ordering guarantees, dispatch with retry/failure
//! bookkeeping, and startup recovery of events stranded mid-dispatch by a
//! crash (spec §4.3 supplemental, §5).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use leasemgr_common::filter::{ComparisonOp, FieldFilter, Filters, SortDirection};
use leasemgr_common::model::{Event, EventStatus, EventType};
use leasemgr_common::notification::{topics, NotificationPayload};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::lifecycle::LifecycleHandlers;
use crate::notification::NotificationSink;
use crate::repository::{EventPatch, Repository};

pub struct EventEngine {
    repo: Arc<dyn Repository>,
    handlers: Arc<LifecycleHandlers>,
    notifications: Arc<dyn NotificationSink>,
    retry_window: ChronoDuration,
    tick_interval: StdDuration,
    recovery_stale_ticks: u32,
}

impl EventEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        handlers: Arc<LifecycleHandlers>,
        notifications: Arc<dyn NotificationSink>,
        retry_window: ChronoDuration,
        tick_interval: StdDuration,
        recovery_stale_ticks: u32,
    ) -> Self {
        Self { repo, handlers, notifications, retry_window, tick_interval, recovery_stale_ticks }
    }

    /// Startup sweep: any event left `IN_PROGRESS` from before a crash,
    /// older than `recovery_stale_ticks * tick_interval`, goes back to
    /// `UNDONE` so it gets retried rather than stranded forever.
    pub async fn recover_in_progress(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let tick = ChronoDuration::from_std(self.tick_interval).unwrap_or(ChronoDuration::seconds(10));
        let stale_before = now - tick * self.recovery_stale_ticks as i32;

        let mut filters = Filters::new();
        filters.insert("status".to_string(), FieldFilter::eq("IN_PROGRESS"));
        filters.insert("time".to_string(), FieldFilter::time(ComparisonOp::Lt, stale_before));
        let stale = self.repo.event_get_all_sorted_by_filters("time", SortDirection::Asc, filters).await?;

        for event in stale {
            tracing::warn!(event_id = %event.id, lease_id = %event.lease_id, "recovering stranded in-progress event");
            self.repo
                .event_update(event.id, EventPatch { status: Some(EventStatus::Undone), ..Default::default() })
                .await?;
        }
        Ok(())
    }

    /// One engine tick (spec §4.3 steps 1-2): fetch all due events,
    /// partition into ordered batches, and run each batch to completion
    /// before moving to the next.
    pub async fn process_due_events(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let mut filters = Filters::new();
        filters.insert("status".to_string(), FieldFilter::eq("UNDONE"));
        filters.insert("time".to_string(), FieldFilter::time(ComparisonOp::Le, now));
        let due = self.repo.event_get_all_sorted_by_filters("time", SortDirection::Asc, filters).await?;
        if due.is_empty() {
            return Ok(());
        }

        for batch in select_for_execution(due) {
            self.run_batch(batch, now).await;
        }
        Ok(())
    }

    async fn run_batch(&self, batch: Vec<Event>, now: DateTime<Utc>) {
        let mut tasks = tokio::task::JoinSet::new();
        for event in batch {
            let repo = self.repo.clone();
            let handlers = self.handlers.clone();
            let notifications = self.notifications.clone();
            let retry_window = self.retry_window;
            tasks.spawn(async move {
                dispatch_event(&repo, &handlers, &notifications, retry_window, event, now).await;
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "event-handling task panicked");
            }
        }
    }
}

async fn dispatch_event(
    repo: &Arc<dyn Repository>,
    handlers: &LifecycleHandlers,
    notifications: &Arc<dyn NotificationSink>,
    retry_window: ChronoDuration,
    event: Event,
    now: DateTime<Utc>,
) {
    let lease = match repo.lease_get(event.lease_id).await {
        Ok(lease) => lease,
        Err(err) => {
            tracing::warn!(event_id = %event.id, error = %err, "owning lease missing; skipping event");
            return;
        }
    };
    // Step 3: the lease must be stable, or we skip — next tick retries.
    if !lease.status.is_stable() {
        return;
    }

    if let Err(err) = repo
        .event_update(event.id, EventPatch { status: Some(EventStatus::InProgress), ..Default::default() })
        .await
    {
        tracing::error!(event_id = %event.id, error = %err, "failed to mark event in progress");
        return;
    }

    let outcome = match event.event_type {
        EventType::StartLease => handlers.start_lease(event.lease_id).await,
        EventType::EndLease => handlers.end_lease(event.lease_id).await,
        EventType::BeforeEndLease => handlers.before_end_lease(event.lease_id).await,
    };

    match outcome {
        Ok(()) => {
            let _ = repo
                .event_update(event.id, EventPatch { status: Some(EventStatus::Done), ..Default::default() })
                .await;
            if let Ok(lease) = repo.lease_get(event.lease_id).await {
                notifications
                    .publish(NotificationPayload::new(topics::event(event.event_type.as_str()), lease))
                    .await;
            }
        }
        Err(err) if err.is_invalid_status() && now - event.time <= retry_window => {
            tracing::info!(event_id = %event.id, "invalid-status failure within retry window, reverting to undone");
            let _ = repo
                .event_update(event.id, EventPatch { status: Some(EventStatus::Undone), ..Default::default() })
                .await;
        }
        Err(err) => {
            tracing::error!(event_id = %event.id, error = %err, "event handler failed permanently");
            let _ = repo
                .event_update(event.id, EventPatch { status: Some(EventStatus::Error), ..Default::default() })
                .await;
        }
    }
}

/// Partitions `events` (already filtered to `UNDONE` and due) into
/// ordered, safely-concurrent batches (spec §4.3). Events at the same
/// instant are prioritized: non-deferred `before_end_lease`, then
/// non-deferred `end_lease`, then `start_lease`, then the deferred
/// siblings of any lease whose `start_lease` also fired at that instant —
/// this keeps a lease's own before_end/end from racing its own start,
/// while still letting an unrelated lease's end free resources before
/// another lease's start at the same instant.
pub fn select_for_execution(mut events: Vec<Event>) -> Vec<Vec<Event>> {
    events.sort_by_key(|e| e.time);
    let mut batches = Vec::new();
    let mut remaining = events;

    while !remaining.is_empty() {
        let t = remaining[0].time;
        let split_at = remaining.iter().position(|e| e.time != t).unwrap_or(remaining.len());
        let rest = remaining.split_off(split_at);
        let first_events = remaining;
        remaining = rest;

        let starting_leases: HashSet<Uuid> = first_events
            .iter()
            .filter(|e| e.event_type == EventType::StartLease)
            .map(|e| e.lease_id)
            .collect();

        let mut before_end_now = Vec::new();
        let mut before_end_deferred = Vec::new();
        let mut end_now = Vec::new();
        let mut end_deferred = Vec::new();
        let mut start_now = Vec::new();

        for event in first_events {
            match event.event_type {
                EventType::StartLease => start_now.push(event),
                EventType::BeforeEndLease => {
                    if starting_leases.contains(&event.lease_id) {
                        before_end_deferred.push(event);
                    } else {
                        before_end_now.push(event);
                    }
                }
                EventType::EndLease => {
                    if starting_leases.contains(&event.lease_id) {
                        end_deferred.push(event);
                    } else {
                        end_now.push(event);
                    }
                }
            }
        }

        for batch in [before_end_now, end_now, start_now, before_end_deferred, end_deferred] {
            if !batch.is_empty() {
                batches.push(batch);
            }
        }
    }

    batches
}
