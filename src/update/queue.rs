// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Per-instance FIFO of pending updates.

use crate::update::flags::Update;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Pending updates keyed by instance (`namespace/name`).
///
/// Watch mappers push from synchronous closures, so this uses a std mutex and
/// never holds it across an await point.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    updates: Mutex<HashMap<String, VecDeque<Update>>>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Update>>> {
        // A panic while holding the lock leaves the map consistent, keep going
        self.updates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an update unless an identical one is already queued
    pub fn push(&self, key: &str, update: Update) {
        let mut updates = self.lock();
        let queue = updates.entry(key.to_string()).or_default();
        if queue.contains(&update) {
            debug!("Update {:?} already queued for {}", update.true_flags(), key);
            return;
        }
        queue.push_back(update);
    }

    /// The next update without removing it, empty when nothing is queued
    pub fn peek(&self, key: &str) -> Update {
        self.lock()
            .get(key)
            .and_then(|q| q.front().copied())
            .unwrap_or_default()
    }

    /// Remove and return the next update, empty when nothing is queued
    pub fn pop(&self, key: &str) -> Update {
        let mut updates = self.lock();
        let Some(queue) = updates.get_mut(key) else {
            return Update::default();
        };
        let update = queue.pop_front().unwrap_or_default();
        if queue.is_empty() {
            updates.remove(key);
        }
        update
    }

    /// True while the head of the queue still carries work
    pub fn not_empty(&self, key: &str) -> bool {
        !self.peek(key).true_flags().is_empty()
    }

    pub fn len(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, VecDeque::len)
    }

    /// Drop everything queued for a deleted instance
    pub fn clear(&self, key: &str) {
        self.lock().remove(key);
    }
}
