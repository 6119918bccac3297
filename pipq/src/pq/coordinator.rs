//! Delete-min: announce, compete, coordinate.
//!
//! A requesting thread publishes its announce slot and then competes twice:
//!
//! 1. for its zone's compete lock; losers keep helping (pulling their own
//!    worker minimum up into the leader set) until the lock word moves or
//!    their request has been served by someone else
//! 2. for the global coordinator lock, helping the same way while waiting
//!
//! The thread holding both serves every pending slot of its zone from the
//! leader set, refilling any worker whose leader count falls below
//! [`REFILL_THRESHOLD`]. Delete-min is linearized inside that batch.

use super::context::ThreadContext;
use super::stats::WorkerStats;
use super::{Pipq, Value};
use crate::config::REFILL_THRESHOLD;
use crate::epoch::Guard;
use crate::leader::LeaderEntry;
use crate::lock::Spin;
use crate::sync::atomic::Ordering;

impl<V: Value> Pipq<V> {
    pub(crate) fn delete_min_local(&self, ctx: &ThreadContext<'_, V>) -> Option<LeaderEntry<V>> {
        let announce = &ctx.worker().announce;
        let guard = ctx.handle.pin();

        announce.publish();
        self.compete(ctx, &guard);
        debug_assert!(!announce.is_pending());

        // SAFETY: we are the requester and the slot is no longer pending
        unsafe { announce.take() }
    }

    fn compete(&self, ctx: &ThreadContext<'_, V>, guard: &Guard<'_>) {
        let zone = &self.zones[ctx.slot.zone];
        let announce = &ctx.worker().announce;

        let Some(_zone_lock) = zone.compete.acquire_with(|| {
            self.help_upsert(ctx, guard);
            if announce.is_pending() {
                Spin::Continue
            } else {
                Spin::Abort
            }
        }) else {
            return;
        };

        // Served by the previous holder while we were acquiring.
        if !announce.is_pending() {
            return;
        }

        if let Some(_coordinator) = self.coordinator.acquire_with(|| {
            self.help_upsert(ctx, guard);
            Spin::Continue
        }) {
            self.coordinate(ctx, guard);
        }
    }

    fn coordinate(&self, ctx: &ThreadContext<'_, V>, guard: &Guard<'_>) {
        let active = self.in_coordinate.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_coordinators.fetch_max(active, Ordering::Relaxed);

        let mut served = 0;
        for target in self.zones[ctx.slot.zone].workers.iter() {
            if target.announce.is_pending() {
                let result = self.delete_min_leader(ctx, guard);
                // SAFETY: we hold the zone and coordinator locks, so no other
                // thread serves this zone's slots
                unsafe { target.announce.serve(result) };
                served += 1;
            }
        }

        ctx.worker().stats.record_batch(served);
        self.in_coordinate.fetch_sub(1, Ordering::AcqRel);
    }

    fn delete_min_leader(
        &self,
        ctx: &ThreadContext<'_, V>,
        guard: &Guard<'_>,
    ) -> Option<LeaderEntry<V>> {
        let entry = self.leader.delete_min(guard)?;

        let owner = self.owner_worker(entry.owner);
        let remaining = owner.leader_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining < REFILL_THRESHOLD {
            WorkerStats::bump(&ctx.worker().stats.coord_pull_ups);

            // The owner may refill itself meanwhile; stop waiting once it has.
            let state = owner.state.acquire_with(|| {
                if owner.leader_count() >= REFILL_THRESHOLD {
                    Spin::Abort
                } else {
                    Spin::Continue
                }
            });
            if let Some(mut state) = state {
                self.refill(&mut state, owner, entry.owner, guard);
            }
        }

        Some(entry)
    }
}
