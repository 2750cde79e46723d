//! Listener registry
//!
//! Listeners are closures registered against one event type. Posting an
//! event queues it; the thread that finds the queue idle drains it,
//! calling every listener in registration order. An event posted while a
//! drain is running (from a listener or another thread) joins the queue
//! and is delivered by that same drain, so listeners are never re-entered.
//!
//! # Invariants
//!
//! - Events are delivered in the order they were posted
//! - A listener removed during a drain receives no further events
//! - No lock is held while a listener runs

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Inner<E> {
    next_id: u64,
    listeners: Vec<(u64, Callback<E>)>,
    queue: VecDeque<E>,
    draining: bool,
    /// Listeners removed while a drain was running
    removed: HashSet<u64>,
}

impl<E> Inner<E> {
    fn compact(&mut self) {
        let removed = std::mem::take(&mut self.removed);
        self.listeners.retain(|(id, _)| !removed.contains(id));
    }
}

struct Shared<E> {
    inner: Mutex<Inner<E>>,
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

trait ListenerRemoval: Send + Sync {
    fn remove_listener(&self, id: u64);
}

impl<E: Send> ListenerRemoval for Shared<E> {
    fn remove_listener(&self, id: u64) {
        let mut inner = self.lock();
        inner.removed.insert(id);
        if !inner.draining {
            inner.compact();
        }
    }
}

pub struct ListenerRegistry<E> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for ListenerRegistry<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &inner.listeners.len())
            .field("queued", &inner.queue.len())
            .finish()
    }
}

impl<E: Send + 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send + 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    next_id: 1,
                    listeners: Vec::new(),
                    queue: VecDeque::new(),
                    draining: false,
                    removed: HashSet::new(),
                }),
            }),
        }
    }

    /// Registers a listener
    pub fn add<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = self.shared.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        drop(inner);

        let registry: Weak<dyn ListenerRemoval> = Arc::downgrade(&self.shared) as Weak<dyn ListenerRemoval>;
        ListenerToken {
            id,
            registry,
            removed: AtomicBool::new(false),
        }
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        let inner = self.shared.lock();
        inner
            .listeners
            .iter()
            .filter(|(id, _)| !inner.removed.contains(id))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues an event and, unless a drain is already running, delivers
    /// everything queued
    pub fn post(&self, event: E) {
        self.enqueue(event);
        self.flush();
    }

    /// Queues an event without delivering it
    ///
    /// Lets a caller fix the delivery order while holding its own lock and
    /// deliver with `flush` after releasing it.
    pub fn enqueue(&self, event: E) {
        self.shared.lock().queue.push_back(event);
    }

    /// Delivers queued events unless another drain is already running
    pub fn flush(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.draining || inner.queue.is_empty() {
                return;
            }
            inner.draining = true;
        }

        let mut guard = DrainGuard {
            shared: &self.shared,
            armed: true,
        };
        loop {
            let (event, listeners) = {
                let mut inner = self.shared.lock();
                match inner.queue.pop_front() {
                    Some(event) => (event, inner.listeners.clone()),
                    None => {
                        // reset under the lock of the final pop
                        inner.draining = false;
                        inner.compact();
                        guard.armed = false;
                        return;
                    }
                }
            };
            for (id, listener) in listeners {
                if self.shared.lock().removed.contains(&id) {
                    continue;
                }
                listener(&event);
            }
        }
    }
}

/// Ends a drain when a listener panics
struct DrainGuard<'a, E> {
    shared: &'a Shared<E>,
    armed: bool,
}

impl<E> Drop for DrainGuard<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.shared.lock();
            inner.draining = false;
            inner.compact();
        }
    }
}

/// Handle to a registered listener
///
/// Dropping the token leaves the listener registered; call `remove`.
pub struct ListenerToken {
    id: u64,
    registry: Weak<dyn ListenerRemoval>,
    removed: AtomicBool,
}

impl ListenerToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unregisters the listener; later calls do nothing
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_listener(self.id);
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerToken")
            .field("id", &self.id)
            .field("removed", &self.is_removed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_delivery_in_registration_order() {
        let registry = ListenerRegistry::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = log.clone();
            registry.add(move |e: &u32| log.lock().unwrap().push(format!("{}{}", name, e)));
        }
        registry.post(1);
        registry.post(2);
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "c1", "a2", "b2", "c2"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ListenerRegistry::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let token = registry.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        registry.post(1);
        token.remove();
        token.remove();
        registry.post(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dropped_token_keeps_listener() {
        let registry = ListenerRegistry::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        drop(registry.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        registry.post(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removes_itself() {
        let registry = ListenerRegistry::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));

        let h = hits.clone();
        let s = slot.clone();
        let token = registry.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = s.lock().unwrap().as_ref() {
                token.remove();
            }
        });
        *slot.lock().unwrap() = Some(token);

        registry.post(1);
        registry.post(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_enqueue_waits_for_flush() {
        let registry = ListenerRegistry::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        registry.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        registry.enqueue(1);
        registry.enqueue(2);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        registry.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_post_from_listener_is_queued() {
        let registry = ListenerRegistry::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_registry = registry.clone();
        let l = log.clone();
        registry.add(move |e: &u32| {
            l.lock().unwrap().push(format!("first{}", e));
            if *e == 1 {
                inner_registry.post(2);
                // not delivered yet: the outer drain owns the queue
                l.lock().unwrap().push("posted".to_string());
            }
        });
        let l = log.clone();
        registry.add(move |e: &u32| l.lock().unwrap().push(format!("second{}", e)));

        registry.post(1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first1", "posted", "second1", "first2", "second2"]
        );
    }
}
