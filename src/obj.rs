//! Reference-counted objects with weak references and safe deletion
//! subscriptions (§4.1). `Shared<T>` plays the role the original system's
//! `Object` base class plays for every heap entity whose lifetime is shared:
//! ordinary strong/weak refcounting plus a *shadow record* that lets weak
//! holders detect, without a dangling read, whether the object has begun its
//! final destruction.
//!
//! Unlike `std::sync::Arc`/`Weak`, `Shared<T>` lets callers subscribe a
//! callback to the object's destruction (optionally gated by a second
//! object's liveness, for A/B mutual-cancellation), and defers destructor
//! execution to the current thread's deletion queue whenever a
//! [`crate::state_mutex::StateMutex`] is held anywhere on the call stack —
//! so a destructor walking `deletion_subscription_list` never runs nested
//! inside a lock a subscriber's callback might also want.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use slab::Slab;

use crate::tls;

/// Key returned by [`Shared::add_deletion_callback`]; pass it to
/// [`Shared::remove_deletion_callback`] to cancel a subscription early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionKey(usize);

/// A type-erased weak reference to some guard object, used to gate a
/// deletion callback (or, via [`crate::cb::Cb`], any other callback) on a
/// second object's liveness without the holder needing to know the guard's
/// concrete type.
pub(crate) trait GuardRef: Send + Sync {
    fn upgrade(&self) -> Option<Box<dyn DynGuard>>;
    fn addr(&self) -> usize;
}

/// A type-erased strong reference, held only for the duration of one
/// gated callback's invocation. Dropping it releases the strong reference
/// taken by [`GuardRef::upgrade`].
pub(crate) trait DynGuard: Send + Sync {
    fn remove_deletion_callback(&self, key: DeletionKey);
}

impl<G: Send + Sync + 'static> GuardRef for WeakRef<G> {
    fn upgrade(&self) -> Option<Box<dyn DynGuard>> {
        WeakRef::upgrade(self).map(|s| Box::new(s) as Box<dyn DynGuard>)
    }

    fn addr(&self) -> usize {
        WeakRef::addr(self)
    }
}

impl<G: Send + Sync + 'static> DynGuard for Shared<G> {
    fn remove_deletion_callback(&self, key: DeletionKey) {
        Shared::remove_deletion_callback(self, key)
    }
}

struct DeletionEntry {
    cb: Option<Box<dyn FnOnce() + Send>>,
    /// Peer whose liveness gates `cb`. `None` means `cb` always fires.
    guard: Option<Box<dyn GuardRef>>,
    /// Key of the mirror subscription on the peer's list, removed when this
    /// entry fires (so the peer never later invokes a callback referencing
    /// an entry we're about to drop).
    mutual_key: Option<DeletionKey>,
}

struct ShadowState<T> {
    back_ptr: Option<NonNull<ControlBlock<T>>>,
    /// Sequences concurrent revival attempts: incremented on every 0->1
    /// strong-count transition, decremented once per `last_unref` call.
    /// Only the call that brings it back to zero actually destroys the
    /// object.
    lastref_cnt: usize,
}

struct Shadow<T> {
    mutex: Mutex<ShadowState<T>>,
}

unsafe impl<T> Send for Shadow<T> {}
unsafe impl<T> Sync for Shadow<T> {}

struct ControlBlock<T> {
    strong: AtomicUsize,
    shadow: OnceLock<Arc<Shadow<T>>>,
    subs: Mutex<Slab<DeletionEntry>>,
    value: UnsafeCell<ManuallyDrop<T>>,
}

/// A strong reference to a heap-allocated, weak-reference-capable object.
pub struct Shared<T> {
    cb: NonNull<ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

/// A weak reference produced by [`Shared::downgrade`]. Upgrading after the
/// last strong reference has dropped yields `None`, never a dangling value.
pub struct WeakRef<T> {
    ptr: NonNull<ControlBlock<T>>,
    shadow: Arc<Shadow<T>>,
}

unsafe impl<T: Send + Sync> Send for WeakRef<T> {}
unsafe impl<T: Send + Sync> Sync for WeakRef<T> {}

struct FinalizeHandle<T>(NonNull<ControlBlock<T>>);
unsafe impl<T> Send for FinalizeHandle<T> {}

impl<T: 'static> tls::DeferredDrop for FinalizeHandle<T> {
    fn finish(self: Box<Self>) {
        Shared::<T>::finish(self.0);
    }
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Shared<T> {
        let cb = Box::new(ControlBlock {
            strong: AtomicUsize::new(1),
            shadow: OnceLock::new(),
            subs: Mutex::new(Slab::new()),
            value: UnsafeCell::new(ManuallyDrop::new(value)),
        });
        Shared {
            cb: NonNull::from(Box::leak(cb)),
        }
    }

    /// Address of the backing control block, stable for the object's
    /// lifetime. Used to detect self-subscription (`guard_obj == this`).
    pub fn addr(&self) -> usize {
        self.cb.as_ptr() as usize
    }

    pub fn ptr_eq(a: &Shared<T>, b: &Shared<T>) -> bool {
        a.addr() == b.addr()
    }

    pub fn strong_count(this: &Shared<T>) -> usize {
        unsafe { this.cb.as_ref() }.strong.load(Ordering::Acquire)
    }

    /// Lazily creates the shadow record shared by all weak references to
    /// this object (§4.1 "Shadow creation"). `OnceLock` supplies the
    /// compare-and-swap race resolution the original gets from a raw atomic
    /// pointer: the loser's attempt is simply dropped.
    pub fn downgrade(this: &Shared<T>) -> WeakRef<T> {
        let cb_ref = unsafe { this.cb.as_ref() };
        let shadow = cb_ref
            .shadow
            .get_or_init(|| {
                Arc::new(Shadow {
                    mutex: Mutex::new(ShadowState {
                        back_ptr: Some(this.cb),
                        lastref_cnt: 1,
                    }),
                })
            })
            .clone();
        WeakRef {
            ptr: this.cb,
            shadow,
        }
    }
}

impl<T: Send + Sync + 'static> Shared<T> {
    /// Subscribes `cb` to this object's destruction. If `guard` is given and
    /// is a distinct object, the subscription is *mutual*: should `guard`
    /// die first, this subscription is cancelled (never fires); should this
    /// object die first (with `guard` still alive), `cb` fires and the
    /// now-meaningless mirror on `guard`'s list is removed.
    pub fn add_deletion_callback<G, F>(this: &Shared<T>, cb: F, guard: Option<&Shared<G>>) -> DeletionKey
    where
        F: FnOnce() + Send + 'static,
        G: Send + Sync + 'static,
    {
        match guard {
            Some(g) if g.addr() != this.addr() => {
                let cb_ref = unsafe { this.cb.as_ref() };
                let key = DeletionKey(cb_ref.subs.lock().unwrap().insert(DeletionEntry {
                    cb: Some(Box::new(cb)),
                    guard: Some(Box::new(Shared::downgrade(g))),
                    mutual_key: None,
                }));

                let this_weak = Shared::downgrade(this);
                let mirror_key = Shared::add_deletion_callback_nonmutual(
                    g,
                    move || {
                        if let Some(strong) = WeakRef::upgrade(&this_weak) {
                            Shared::remove_deletion_callback(&strong, key);
                        }
                    },
                    Some(this),
                );

                cb_ref.subs.lock().unwrap()[key.0].mutual_key = Some(mirror_key);
                key
            }
            _ => Self::add_deletion_callback_nonmutual(this, cb, None::<&Shared<T>>),
        }
    }

    /// Like [`Shared::add_deletion_callback`], but never creates a mirror
    /// subscription on `guard`'s list even if `guard` is distinct. Used
    /// internally for the mutual-cancellation plumbing, and available
    /// directly for callers who only want one-directional gating.
    pub fn add_deletion_callback_nonmutual<G, F>(
        this: &Shared<T>,
        cb: F,
        guard: Option<&Shared<G>>,
    ) -> DeletionKey
    where
        F: FnOnce() + Send + 'static,
        G: Send + Sync + 'static,
    {
        let guard_ref: Option<Box<dyn GuardRef>> = match guard {
            Some(g) if g.addr() != this.addr() => Some(Box::new(Shared::downgrade(g))),
            _ => None,
        };
        let cb_ref = unsafe { this.cb.as_ref() };
        DeletionKey(cb_ref.subs.lock().unwrap().insert(DeletionEntry {
            cb: Some(Box::new(cb)),
            guard: guard_ref,
            mutual_key: None,
        }))
    }

    pub fn remove_deletion_callback(this: &Shared<T>, key: DeletionKey) {
        let entry = unsafe { this.cb.as_ref() }.subs.lock().unwrap().try_remove(key.0);
        if let Some(entry) = entry {
            if let (Some(mutual_key), Some(guard_ref)) = (entry.mutual_key, entry.guard) {
                if let Some(peer) = guard_ref.upgrade() {
                    peer.remove_deletion_callback(mutual_key);
                }
            }
        }
    }

    fn last_unref(cb_ptr: NonNull<ControlBlock<T>>) {
        let cb_ref = unsafe { cb_ptr.as_ref() };
        if let Some(shadow) = cb_ref.shadow.get() {
            let mut state = shadow.mutex.lock().unwrap();
            if cb_ref.strong.load(Ordering::Acquire) > 0 {
                // Re-referenced via a weak upgrade before we took the lock.
                return;
            }
            state.back_ptr = None;
            debug_assert!(state.lastref_cnt > 0);
            state.lastref_cnt -= 1;
            if state.lastref_cnt != 0 {
                // A racing upgrade/last_unref pair is still in flight; the
                // later call will perform the actual destruction.
                return;
            }
        }
        Self::do_delete(cb_ptr);
    }

    fn do_delete(cb_ptr: NonNull<ControlBlock<T>>) {
        if tls::state_mutex_held() {
            tls::deletion_queue_append(Box::new(FinalizeHandle(cb_ptr)));
            return;
        }
        Self::finish(cb_ptr);
    }

    fn finish(cb_ptr: NonNull<ControlBlock<T>>) {
        loop {
            let entry = {
                let mut subs = unsafe { cb_ptr.as_ref() }.subs.lock().unwrap();
                let key = subs.iter().next().map(|(k, _)| k);
                key.map(|k| subs.remove(k))
            };
            let entry = match entry {
                Some(e) => e,
                None => break,
            };

            match entry.guard {
                Some(guard_ref) => {
                    // Upgrading keeps the peer alive for the duration of the
                    // call; if upgrade fails the peer already died first, so
                    // this subscription is cancelled rather than fired.
                    if let Some(peer) = guard_ref.upgrade() {
                        if let Some(mutual_key) = entry.mutual_key {
                            peer.remove_deletion_callback(mutual_key);
                        }
                        if let Some(cb) = entry.cb {
                            cb();
                        }
                    }
                }
                None => {
                    if let Some(cb) = entry.cb {
                        cb();
                    }
                }
            }
        }

        unsafe {
            let cb_ref = cb_ptr.as_ref();
            ManuallyDrop::drop(&mut *cb_ref.value.get());
            drop(Box::from_raw(cb_ptr.as_ptr()));
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;
    fn deref(&self) -> &T {
        let p = unsafe { self.cb.as_ref() }.value.get() as *const T;
        unsafe { &*p }
    }
}

impl<T: Send + Sync + 'static> Clone for Shared<T> {
    fn clone(&self) -> Shared<T> {
        let cb_ref = unsafe { self.cb.as_ref() };
        let prev = cb_ref.strong.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "cloned a Shared<T> with no live strong reference");
        Shared { cb: self.cb }
    }
}

impl<T: Send + Sync + 'static> Drop for Shared<T> {
    fn drop(&mut self) {
        let cb_ref = unsafe { self.cb.as_ref() };
        if cb_ref.strong.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        std::sync::atomic::fence(Ordering::Acquire);
        Self::last_unref(self.cb);
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> WeakRef<T> {
        WeakRef {
            ptr: self.ptr,
            shadow: self.shadow.clone(),
        }
    }
}

impl<T> WeakRef<T> {
    /// Promotes the weak reference to a strong one, unless the object has
    /// already begun its final destruction. Never returns a dangling
    /// reference: the shadow mutex serializes this against `last_unref`.
    pub fn upgrade(this: &WeakRef<T>) -> Option<Shared<T>> {
        let mut state = this.shadow.mutex.lock().unwrap();
        let ptr = state.back_ptr?;
        let cb_ref = unsafe { ptr.as_ref() };
        if cb_ref.strong.fetch_add(1, Ordering::AcqRel) == 0 {
            state.lastref_cnt += 1;
        }
        Some(Shared { cb: ptr })
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T: Send + Sync + 'static> WeakRef<T> {
    /// Type-erases this weak reference for storage alongside callbacks whose
    /// guard type isn't known to the holder (used by [`crate::cb::Cb`]).
    pub(crate) fn into_dyn_guard(self) -> Box<dyn GuardRef> {
        Box::new(self)
    }
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:#x})", self.addr())
    }
}
