// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The work item queue.
//!
//! `push` puts an item at the head (runs next), `enqueue` at the tail. The drain loop
//! itself lives on the executor because running an item needs the whole executor;
//! this type holds the queue and the flags that make the loop non-reentrant.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::work_item::WorkItem;

/// LIFO/FIFO hybrid work item queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scheduler {
    queue: VecDeque<WorkItem>,
    #[serde(skip)]
    is_running: bool,
    #[serde(skip)]
    is_suspended: bool,
    #[serde(skip)]
    pause_requested: bool,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `item` before anything already queued.
    pub fn push(&mut self, item: WorkItem) {
        trace!(
            instance = %item.instance(),
            kind = item.kind_name(),
            "work item pushed"
        );
        self.queue.push_front(item);
    }

    /// Run `item` after everything already queued.
    pub fn enqueue(&mut self, item: WorkItem) {
        trace!(
            instance = %item.instance(),
            kind = item.kind_name(),
            "work item enqueued"
        );
        self.queue.push_back(item);
    }

    pub(crate) fn next(&mut self) -> Option<WorkItem> {
        self.queue.pop_front()
    }

    /// Whether nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued items, head first.
    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.queue.iter()
    }

    /// Remove every queued item.
    pub(crate) fn take_all(&mut self) -> Vec<WorkItem> {
        self.queue.drain(..).collect()
    }

    /// Enter the drain loop. Fails while a loop is active or an item is in flight.
    pub(crate) fn try_begin_drain(&mut self) -> bool {
        if self.is_running || self.is_suspended {
            return false;
        }
        self.is_running = true;
        true
    }

    pub(crate) fn end_drain(&mut self) {
        self.is_running = false;
    }

    /// Whether an asynchronous item is outstanding.
    pub fn is_suspended(&self) -> bool {
        self.is_suspended
    }

    pub(crate) fn set_suspended(&mut self, suspended: bool) {
        self.is_suspended = suspended;
    }

    /// Ask the drain loop to stop after the current item.
    pub fn request_pause(&mut self) {
        self.pause_requested = true;
    }

    pub(crate) fn take_pause_request(&mut self) -> bool {
        std::mem::take(&mut self.pause_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;
    use crate::work_item::{WorkItemKind, WorkItemPool};

    fn item(pool: &mut WorkItemPool, id: u64) -> WorkItem {
        pool.acquire(InstanceId::new(id), WorkItemKind::Empty)
    }

    #[test]
    fn test_push_is_lifo_enqueue_is_fifo() {
        let mut pool = WorkItemPool::default();
        let mut scheduler = Scheduler::new();
        scheduler.enqueue(item(&mut pool, 1));
        scheduler.enqueue(item(&mut pool, 2));
        scheduler.push(item(&mut pool, 3));
        scheduler.push(item(&mut pool, 4));

        let order: Vec<u64> = std::iter::from_fn(|| scheduler.next())
            .map(|i| i.instance().get())
            .collect();
        assert_eq!(order, vec![4, 3, 1, 2]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_drain_is_not_reentrant() {
        let mut scheduler = Scheduler::new();
        assert!(scheduler.try_begin_drain());
        assert!(!scheduler.try_begin_drain());
        scheduler.end_drain();

        scheduler.set_suspended(true);
        assert!(!scheduler.try_begin_drain());
        scheduler.set_suspended(false);
        assert!(scheduler.try_begin_drain());
    }

    #[test]
    fn test_pause_request_is_consumed_once() {
        let mut scheduler = Scheduler::new();
        scheduler.request_pause();
        assert!(scheduler.take_pause_request());
        assert!(!scheduler.take_pause_request());
    }

    #[test]
    fn test_queue_survives_serialization_flags_do_not() {
        let mut pool = WorkItemPool::default();
        let mut scheduler = Scheduler::new();
        scheduler.enqueue(item(&mut pool, 7));
        scheduler.try_begin_drain();

        let json = serde_json::to_string(&scheduler).unwrap();
        let mut back: Scheduler = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 1);
        assert!(back.try_begin_drain());
    }
}
