//! Multi-producer multi-consumer intrusive singly-linked list.
//!
//! This is the queue substrate underneath the callback lanes: producers link
//! nodes with an atomic tail exchange, consumers serialize on a one-byte pop
//! guard and advance the head. A node is only detached once no producer can
//! still reach it (its `next` pointer is published), so a popped node is
//! exclusively owned by its popper and can be re-inserted into a sibling
//! list without touching the allocator.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> Box<Node<T>> {
        Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        })
    }
}

/// An entry detached from a [`LocklessList`], carrying its value together
/// with the node allocation so it can be pushed onto another list without
/// allocating.
pub struct ListNode<T> {
    value: T,
    node: Box<Node<T>>,
}

impl<T> ListNode<T> {
    /// The detached value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Mutable access to the detached value.
    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Consume the entry, dropping the node allocation.
    pub fn into_value(self) -> T {
        self.value
    }
}

/// Ordered MPMC list with a stub head node.
///
/// `push_back` is lock-free (one pointer exchange plus one publishing store).
/// `pop_front` serializes concurrent consumers on an internal spin guard;
/// producers are never blocked by consumers. [`empty`](Self::empty) is
/// approximate under concurrency but exact when the list is used from a
/// single thread.
pub struct LocklessList<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    pop_lock: AtomicBool,
    stub: *mut Node<T>,
}

unsafe impl<T: Send> Send for LocklessList<T> {}
unsafe impl<T: Send> Sync for LocklessList<T> {}

impl<T> Default for LocklessList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocklessList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        let stub = Box::into_raw(Node::new(None));
        LocklessList {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(AtomicPtr::new(stub)),
            pop_lock: AtomicBool::new(false),
            stub,
        }
    }

    /// Append a value, allocating a node for it.
    pub fn push_back(&self, value: T) {
        let node = Box::into_raw(Node::new(Some(value)));
        self.push_raw(node);
    }

    /// Re-insert an entry previously detached with
    /// [`pop_front_node`](Self::pop_front_node), reusing its allocation.
    pub fn push_back_node(&self, entry: ListNode<T>) {
        let ListNode { value, mut node } = entry;
        node.value = Some(value);
        self.push_raw(Box::into_raw(node));
    }

    /// Detach the first value. Returns `None` when the list is empty (or
    /// transiently when a concurrent push has not finished linking).
    pub fn pop_front(&self) -> Option<T> {
        let _guard = self.lock_pop();
        let node = self.pop_raw();
        if node.is_null() {
            return None;
        }
        let mut boxed = unsafe { Box::from_raw(node) };
        boxed.value.take()
    }

    /// Detach the first entry together with its node allocation.
    pub fn pop_front_node(&self) -> Option<ListNode<T>> {
        let _guard = self.lock_pop();
        let node = self.pop_raw();
        if node.is_null() {
            return None;
        }
        let mut boxed = unsafe { Box::from_raw(node) };
        let value = boxed.value.take()?;
        Some(ListNode { value, node: boxed })
    }

    /// Whether the list currently looks empty. May report `false` while a
    /// concurrent pop is draining the final node; consistent with an
    /// immediately following `pop_front` in the single-threaded case.
    pub fn empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        if head != self.stub {
            return false;
        }
        unsafe { (*self.stub).next.load(Ordering::Acquire).is_null() }
    }

    fn push_raw(&self, node: *mut Node<T>) {
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        // The exchange makes `node` the new tail; linking through the old
        // tail's `next` publishes it to consumers.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Detach the front node. Caller must hold the pop guard. The returned
    /// node is exclusively owned: it is only handed out once its `next` is
    /// published, after which no producer can touch it again.
    fn pop_raw(&self) -> *mut Node<T> {
        unsafe {
            loop {
                let head = self.head.load(Ordering::Relaxed);
                let next = (*head).next.load(Ordering::Acquire);

                if head == self.stub {
                    if next.is_null() {
                        return ptr::null_mut();
                    }
                    // Step past the stub and retry on the real front node.
                    self.head.store(next, Ordering::Relaxed);
                    continue;
                }

                if !next.is_null() {
                    self.head.store(next, Ordering::Relaxed);
                    return head;
                }

                // `head` is the last linked node. It can only be detached
                // once the stub is queued behind it; otherwise a producer
                // holding the old tail could still write its `next`.
                let tail = self.tail.load(Ordering::Acquire);
                if head != tail {
                    // A producer exchanged the tail but has not linked yet.
                    return ptr::null_mut();
                }

                self.push_raw(self.stub);

                let next = (*head).next.load(Ordering::Acquire);
                if !next.is_null() {
                    self.head.store(next, Ordering::Relaxed);
                    return head;
                }
                return ptr::null_mut();
            }
        }
    }

    fn lock_pop(&self) -> PopGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .pop_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        PopGuard { list: self }
    }
}

impl<T> Drop for LocklessList<T> {
    fn drop(&mut self) {
        let mut cur = self.head.load(Ordering::Relaxed);
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            if cur != self.stub {
                drop(unsafe { Box::from_raw(cur) });
            }
            cur = next;
        }
        drop(unsafe { Box::from_raw(self.stub) });
    }
}

struct PopGuard<'a, T> {
    list: &'a LocklessList<T>,
}

impl<T> Drop for PopGuard<'_, T> {
    fn drop(&mut self) {
        self.list.pop_lock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_in_order() {
        let list = LocklessList::new();
        assert!(list.empty());

        for i in 0..4u32 {
            list.push_back(i);
            assert!(!list.empty());
        }

        for i in 0..4u32 {
            assert!(!list.empty());
            assert_eq!(list.pop_front(), Some(i));
        }
        assert!(list.empty());
        assert_eq!(list.pop_front(), None);
    }

    #[test]
    fn empty_agrees_with_pop_single_threaded() {
        let list = LocklessList::new();
        list.push_back(7u32);

        assert!(!list.empty());
        assert_eq!(list.pop_front(), Some(7));
        assert!(list.empty());
        assert_eq!(list.pop_front(), None);
    }

    #[test]
    fn node_transfer_between_lists() {
        let src = LocklessList::new();
        for i in 0..3u32 {
            src.push_back(i);
        }

        // Move every entry to a sibling list, reusing the node allocations.
        let dst = LocklessList::new();
        while let Some(entry) = src.pop_front_node() {
            dst.push_back_node(entry);
        }
        assert!(src.empty());

        for i in 0..3u32 {
            assert_eq!(dst.pop_front(), Some(i));
        }
        assert!(dst.empty());
    }

    #[test]
    fn node_value_access() {
        let list = LocklessList::new();
        list.push_back(String::from("a"));

        let mut entry = list.pop_front_node().unwrap();
        assert_eq!(entry.value(), "a");
        entry.value_mut().push('b');
        assert_eq!(entry.into_value(), "ab");
    }

    #[test]
    fn interleaved_push_pop() {
        let list = LocklessList::new();
        list.push_back(1u32);
        list.push_back(2);
        assert_eq!(list.pop_front(), Some(1));
        list.push_back(3);
        assert_eq!(list.pop_front(), Some(2));
        assert_eq!(list.pop_front(), Some(3));
        assert_eq!(list.pop_front(), None);
    }

    #[test]
    fn drop_releases_remaining_values() {
        let list = LocklessList::new();
        for i in 0..16u32 {
            list.push_back(i);
        }
        let _ = list.pop_front();
        // Remaining nodes (and the stub) are freed by Drop.
    }
}
