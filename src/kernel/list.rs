/*
 * FreeRTOS Kernel <DEVELOPMENT BRANCH>
 * Copyright (C) 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
 *
 * SPDX-License-Identifier: MIT
 */

/*
 * This is the list implementation used by the scheduler. Lists never own the
 * tasks they order: every task carries two list items (one for its state list,
 * one for an event list) inside its control block, and a list only records the
 * handles of its first and last members. The links themselves live in the
 * items, so an item can be unlinked in constant time given its owner.
 *
 * Most lists are sorted in ascending item value order. Ready lists are used
 * as plain FIFOs and ignore the value.
 */

//! Kernel List Implementation
//!
//! - [`ListItem`] - link fields embedded in a task control block
//! - [`List`] - head/tail/length of one list
//! - [`ItemStore`] - access to the items, implemented by the task arena
//! - [`ListId`] - names every list the scheduler owns
//!
//! An empty list has no head; `None` in a link field is the end marker.

use crate::kernel::task::TaskHandle;
use crate::types::*;

// =============================================================================
// List Identity
// =============================================================================

/// Handle of a scheduler-owned event list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventListId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Names a list owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListId {
    /// Ready list of one priority level.
    Ready(u8),
    /// One of the two delayed lists.
    Delayed(u8),
    /// Suspended tasks and tasks blocked without timeout.
    Suspended,
    /// Tasks readied while the scheduler was suspended.
    PendingReady,
    /// Tasks that deleted themselves and await idle-time cleanup.
    WaitingTermination,
    /// Waiters on a synchronisation object.
    Event(EventListId),
}

/// Which of the two items of a task a list links through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    State,
    Event,
}

// =============================================================================
// List Item Structure
// =============================================================================

/// Link fields of one list membership.
#[derive(Debug, Clone)]
pub struct ListItem {
    #[cfg(feature = "list-data-integrity-check")]
    check1: Tick,
    /// Sort key: wake tick in delayed lists, inverted priority in event lists.
    pub(crate) value: Tick,
    pub(crate) next: Option<TaskHandle>,
    pub(crate) prev: Option<TaskHandle>,
    /// The list this item is in, if any.
    pub(crate) container: Option<ListId>,
    #[cfg(feature = "list-data-integrity-check")]
    check2: Tick,
}

impl ListItem {
    pub const fn new() -> Self {
        ListItem {
            #[cfg(feature = "list-data-integrity-check")]
            check1: INTEGRITY_CHECK_VALUE,
            value: 0,
            next: None,
            prev: None,
            container: None,
            #[cfg(feature = "list-data-integrity-check")]
            check2: INTEGRITY_CHECK_VALUE,
        }
    }

    pub fn value(&self) -> Tick {
        self.value
    }

    pub fn container(&self) -> Option<ListId> {
        self.container
    }

    pub fn is_linked(&self) -> bool {
        self.container.is_some()
    }

    #[inline]
    fn verify(&self) {
        #[cfg(feature = "list-data-integrity-check")]
        if self.check1 != INTEGRITY_CHECK_VALUE || self.check2 != INTEGRITY_CHECK_VALUE {
            fatal(FatalError::ListCorrupted);
        }
    }
}

impl Default for ListItem {
    fn default() -> Self {
        ListItem::new()
    }
}

/// Storage of the list items a list links together.
pub trait ItemStore {
    fn item(&self, owner: TaskHandle, kind: ItemKind) -> &ListItem;
    fn item_mut(&mut self, owner: TaskHandle, kind: ItemKind) -> &mut ListItem;
}

// =============================================================================
// List Structure
// =============================================================================

/// One kernel list.
#[derive(Debug, Clone)]
pub struct List {
    #[cfg(feature = "list-data-integrity-check")]
    check1: Tick,
    id: ListId,
    kind: ItemKind,
    len: usize,
    head: Option<TaskHandle>,
    tail: Option<TaskHandle>,
    #[cfg(feature = "list-data-integrity-check")]
    check2: Tick,
}

impl List {
    pub const fn new(id: ListId, kind: ItemKind) -> Self {
        List {
            #[cfg(feature = "list-data-integrity-check")]
            check1: INTEGRITY_CHECK_VALUE,
            id,
            kind,
            len: 0,
            head: None,
            tail: None,
            #[cfg(feature = "list-data-integrity-check")]
            check2: INTEGRITY_CHECK_VALUE,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Owner of the first item.
    pub fn head(&self) -> Option<TaskHandle> {
        self.head
    }

    /// Value of the first item, the minimum of a sorted list.
    pub fn head_value<S: ItemStore>(&self, store: &S) -> Option<Tick> {
        self.head.map(|h| store.item(h, self.kind).value)
    }

    pub fn contains<S: ItemStore>(&self, store: &S, owner: TaskHandle) -> bool {
        store.item(owner, self.kind).container == Some(self.id)
    }

    #[inline]
    fn verify(&self) {
        #[cfg(feature = "list-data-integrity-check")]
        if self.check1 != INTEGRITY_CHECK_VALUE || self.check2 != INTEGRITY_CHECK_VALUE {
            fatal(FatalError::ListCorrupted);
        }
    }

    /// Append `owner` at the tail.
    pub fn insert_end<S: ItemStore>(&mut self, store: &mut S, owner: TaskHandle) {
        self.verify();
        let tail = self.tail;
        let item = store.item_mut(owner, self.kind);
        item.verify();
        if item.container.is_some() {
            fatal(FatalError::ListCorrupted);
        }
        item.prev = tail;
        item.next = None;
        item.container = Some(self.id);

        match tail {
            Some(t) => store.item_mut(t, self.kind).next = Some(owner),
            None => self.head = Some(owner),
        }
        self.tail = Some(owner);
        self.len += 1;
    }

    /// Insert `owner` in ascending value order, after every item with an
    /// equal value. The item value must already be set.
    pub fn insert<S: ItemStore>(&mut self, store: &mut S, owner: TaskHandle) {
        self.verify();
        let value = store.item(owner, self.kind).value;

        let mut cursor = self.head;
        while let Some(h) = cursor {
            let item = store.item(h, self.kind);
            if item.value > value {
                break;
            }
            cursor = item.next;
        }

        let next = match cursor {
            Some(next) => next,
            None => return self.insert_end(store, owner),
        };

        let prev = store.item(next, self.kind).prev;
        let item = store.item_mut(owner, self.kind);
        item.verify();
        if item.container.is_some() {
            fatal(FatalError::ListCorrupted);
        }
        item.prev = prev;
        item.next = Some(next);
        item.container = Some(self.id);

        store.item_mut(next, self.kind).prev = Some(owner);
        match prev {
            Some(p) => store.item_mut(p, self.kind).next = Some(owner),
            None => self.head = Some(owner),
        }
        self.len += 1;
    }

    /// Unlink `owner` and return the number of items left.
    pub fn remove<S: ItemStore>(&mut self, store: &mut S, owner: TaskHandle) -> usize {
        self.verify();
        let item = store.item_mut(owner, self.kind);
        item.verify();
        if item.container != Some(self.id) {
            fatal(FatalError::ListCorrupted);
        }
        let prev = item.prev.take();
        let next = item.next.take();
        item.container = None;

        match prev {
            Some(p) => store.item_mut(p, self.kind).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => store.item_mut(n, self.kind).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        self.len
    }

    /// Remove and return the first item.
    pub fn pop_head<S: ItemStore>(&mut self, store: &mut S) -> Option<TaskHandle> {
        let head = self.head?;
        self.remove(store, head);
        Some(head)
    }

    /// Move the head to the tail.
    pub fn rotate<S: ItemStore>(&mut self, store: &mut S) {
        if self.len < 2 {
            return;
        }
        if let Some(head) = self.pop_head(store) {
            self.insert_end(store, head);
        }
    }

    pub fn iter<'a, S: ItemStore>(&self, store: &'a S) -> ListIter<'a, S> {
        ListIter {
            store,
            kind: self.kind,
            cursor: self.head,
        }
    }
}

/// Walks a list from head to tail.
pub struct ListIter<'a, S> {
    store: &'a S,
    kind: ItemKind,
    cursor: Option<TaskHandle>,
}

impl<'a, S: ItemStore> Iterator for ListIter<'a, S> {
    type Item = TaskHandle;

    fn next(&mut self) -> Option<TaskHandle> {
        let current = self.cursor?;
        self.cursor = self.store.item(current, self.kind).next;
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Items(Vec<[ListItem; 2]>);

    impl Items {
        fn with(n: usize) -> (Self, Vec<TaskHandle>) {
            let items = (0..n).map(|_| [ListItem::new(), ListItem::new()]).collect();
            let handles = (0..n as u32).map(|i| TaskHandle::new(i, 0)).collect();
            (Items(items), handles)
        }

        fn set_value(&mut self, owner: TaskHandle, kind: ItemKind, value: Tick) {
            self.item_mut(owner, kind).value = value;
        }
    }

    impl ItemStore for Items {
        fn item(&self, owner: TaskHandle, kind: ItemKind) -> &ListItem {
            &self.0[owner.index()][kind as usize]
        }

        fn item_mut(&mut self, owner: TaskHandle, kind: ItemKind) -> &mut ListItem {
            &mut self.0[owner.index()][kind as usize]
        }
    }

    fn order(list: &List, store: &Items) -> Vec<usize> {
        list.iter(store).map(|h| h.index()).collect()
    }

    #[test]
    fn insert_end_is_fifo() {
        let (mut store, h) = Items::with(3);
        let mut list = List::new(ListId::Ready(1), ItemKind::State);
        for &t in &h {
            list.insert_end(&mut store, t);
        }
        assert_eq!(order(&list, &store), [0, 1, 2]);
        assert_eq!(list.head(), Some(h[0]));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn ordered_insert_keeps_equal_values_fifo() {
        let (mut store, h) = Items::with(4);
        let mut list = List::new(ListId::Delayed(0), ItemKind::State);
        for (t, v) in h.iter().zip([30, 10, 30, 20]) {
            store.set_value(*t, ItemKind::State, v);
            list.insert(&mut store, *t);
        }
        assert_eq!(order(&list, &store), [1, 3, 0, 2]);
        assert_eq!(list.head_value(&store), Some(10));
    }

    #[test]
    fn remove_relinks_neighbours() {
        let (mut store, h) = Items::with(3);
        let mut list = List::new(ListId::Suspended, ItemKind::State);
        for &t in &h {
            list.insert_end(&mut store, t);
        }
        assert_eq!(list.remove(&mut store, h[1]), 2);
        assert_eq!(order(&list, &store), [0, 2]);
        assert!(!list.contains(&store, h[1]));
        assert!(!store.item(h[1], ItemKind::State).is_linked());

        list.remove(&mut store, h[0]);
        list.remove(&mut store, h[2]);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.pop_head(&mut store), None);
    }

    #[test]
    fn rotate_moves_head_to_tail() {
        let (mut store, h) = Items::with(3);
        let mut list = List::new(ListId::Ready(2), ItemKind::State);
        for &t in &h {
            list.insert_end(&mut store, t);
        }
        list.rotate(&mut store);
        assert_eq!(order(&list, &store), [1, 2, 0]);
        list.rotate(&mut store);
        assert_eq!(order(&list, &store), [2, 0, 1]);
    }

    #[test]
    fn state_and_event_items_are_independent() {
        let (mut store, h) = Items::with(2);
        let mut delayed = List::new(ListId::Delayed(1), ItemKind::State);
        let mut waiters = List::new(
            ListId::Event(EventListId { index: 0, generation: 0 }),
            ItemKind::Event,
        );
        delayed.insert(&mut store, h[0]);
        waiters.insert(&mut store, h[0]);
        assert!(delayed.contains(&store, h[0]));
        assert!(waiters.contains(&store, h[0]));
        waiters.remove(&mut store, h[0]);
        assert!(delayed.contains(&store, h[0]));
    }

    #[test]
    #[should_panic(expected = "list data corrupted")]
    fn double_insert_is_fatal() {
        let (mut store, h) = Items::with(1);
        let mut a = List::new(ListId::Suspended, ItemKind::State);
        let mut b = List::new(ListId::WaitingTermination, ItemKind::State);
        a.insert_end(&mut store, h[0]);
        b.insert_end(&mut store, h[0]);
    }

    #[cfg(feature = "list-data-integrity-check")]
    #[test]
    #[should_panic(expected = "list data corrupted")]
    fn corrupted_item_is_fatal() {
        let (mut store, h) = Items::with(1);
        store.item_mut(h[0], ItemKind::State).check2 = 0;
        let mut list = List::new(ListId::Suspended, ItemKind::State);
        list.insert_end(&mut store, h[0]);
    }
}
