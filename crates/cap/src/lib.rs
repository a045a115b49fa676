/* Copyright (c) 2023 Jeremy Davis (jeremydavis519@gmail.com)
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy of this software
 * and associated documentation files (the "Software"), to deal in the Software without restriction,
 * including without limitation the rights to use, copy, modify, merge, publish, distribute,
 * sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all copies or
 * substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT
 * NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
 * NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
 * DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
 */

//! The per-task capability table: a sparse array mapping small integer handles to typed kernel
//! objects (phones, waitqs, IRQs, ...).
//!
//! This crate intentionally has no idea what a phone or a waitq actually *is*. Every concrete
//! kernel object that can be published into a table implements [`KObject`] where it's defined
//! (`kernel-ipc`'s `Phone`, `kernel-waitq`'s `Waitq`, ...) and the table only ever stores
//! `Arc<dyn KObject>`, type-checked at lookup time by `kind()` and, if the caller wants the
//! concrete type back, by `core::any::Any` downcast. This keeps the dependency graph a DAG:
//! `kernel-task` depends on both this crate and on `kernel-ipc`/`kernel-waitq`, but those two
//! never need to depend on this one.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;

use {
    alloc::{sync::Arc, vec::Vec},
    core::any::Any,

    error::{KernelError, KernelResult},
    i18n::Text,
    locks::Mutex,
};

/// The coarse classification of a published kernel object, checked by `kobject_get` before a
/// caller is allowed to use a handle as a particular kind of thing. Finer-grained type checking
/// (getting back the actual concrete type) goes through `Any` on top of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KObjectKind {
    /// An IPC phone (`kernel-ipc::Phone`).
    Phone,
    /// A waitq (`kernel-waitq::Waitq`).
    Waitq,
    /// A mapped address-space area (`kernel-as::Area`).
    Area,
    /// An IRQ subscription.
    Irq,
    /// Any other kind of object a higher layer wants to publish through the same table.
    Other(&'static str)
}

/// Anything that can be published into a capability table.
pub trait KObject: Any + Send + Sync {
    /// This object's coarse kind, checked by `kobject_get`.
    fn kind(&self) -> KObjectKind;

    /// Called exactly once, when this capability is revoked -- either by an explicit
    /// `cap_unpublish` or by the task-exit sweep -- before the table drops its `Arc` to it.
    /// The default does nothing; concrete kinds that need to unblock sleepers or tear down
    /// routing state (e.g. a waitq waking every sleeper with a hangup code) override this.
    fn on_revoke(&self) {}
}

impl dyn KObject {
    /// Downcasts a published object to its concrete type, if `T` is really what's stored here.
    pub fn downcast_ref<T: KObject>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }

    /// Downcasts an owned `Arc<dyn KObject>` to a concrete `Arc<T>`, the way `Arc<dyn Any>` would
    /// if this trait extended it instead of merely requiring it. On a type mismatch, hands the
    /// original `Arc` back unchanged so the caller can report `KObjectKind` instead of panicking.
    pub fn downcast_arc<T: KObject>(this: Arc<dyn KObject>) -> Result<Arc<T>, Arc<dyn KObject>> {
        if (&*this as &dyn Any).is::<T>() {
            let ptr = Arc::into_raw(this) as *const T;
            // Safety: `ptr` was just obtained from `Arc::into_raw` on an `Arc` whose payload is
            // confirmed (via the `is::<T>()` check above) to actually be a `T`, so reconstituting
            // it as `Arc<T>` at the same address recovers exactly the allocation `into_raw` gave up.
            Ok(unsafe { Arc::from_raw(ptr) })
        } else {
            Err(this)
        }
    }
}

/// A handle: a small integer naming a slot in a task's capability table. Opaque and meaningless
/// outside the table that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

#[derive(Debug)]
enum Slot {
    Free,
    /// Allocated but not yet (or no longer) visible to syscalls.
    Reserved,
    /// Visible to syscalls and backed by a live object.
    Published(Arc<dyn KObject>)
}

/// A per-task table of capability handles. `kernel-task` embeds one of these per task.
pub struct CapTable {
    slots: Mutex<Vec<Slot>>
}

impl CapTable {
    /// An empty table.
    pub const fn new() -> CapTable {
        CapTable { slots: Mutex::new(Vec::new()) }
    }

    fn with_slots<R>(&self, f: impl FnOnce(&mut Vec<Slot>) -> R) -> R {
        loop {
            if let Ok(mut slots) = self.slots.try_lock() {
                return f(&mut slots);
            }
        }
    }

    /// Reserves the lowest free handle in the table, without yet publishing anything into it.
    pub fn cap_alloc(&self) -> Handle {
        self.with_slots(|slots| {
            for (i, slot) in slots.iter_mut().enumerate() {
                if matches!(slot, Slot::Free) {
                    *slot = Slot::Reserved;
                    return Handle(i as u32);
                }
            }
            slots.push(Slot::Reserved);
            Handle((slots.len() - 1) as u32)
        })
    }

    /// Publishes `kobj` into a handle previously returned by `cap_alloc`, making it visible to
    /// syscalls. The object's effective refcount is the `Arc` now held by the table.
    pub fn cap_publish(&self, handle: Handle, kobj: Arc<dyn KObject>) -> KernelResult<()> {
        self.with_slots(|slots| {
            match slots.get_mut(handle.0 as usize) {
                Some(slot @ Slot::Reserved) => { *slot = Slot::Published(kobj); Ok(()) },
                Some(Slot::Published(_)) => Err(KernelError::Inval),
                Some(Slot::Free) | None => Err({ let _ = Text::CapNotFound(&handle.0); KernelError::NoEnt })
            }
        })
    }

    /// The inverse of `cap_publish`: makes the handle invisible to syscalls again and hands the
    /// object back to the caller (to drop, or to `cap_publish` again under the same handle).
    /// The handle itself is NOT freed; call `cap_free` for that.
    pub fn cap_unpublish(&self, handle: Handle) -> KernelResult<Arc<dyn KObject>> {
        self.with_slots(|slots| {
            match slots.get_mut(handle.0 as usize) {
                Some(slot @ Slot::Published(_)) => {
                    match core::mem::replace(slot, Slot::Reserved) {
                        Slot::Published(kobj) => Ok(kobj),
                        _ => unreachable!()
                    }
                },
                Some(_) => Err({ let _ = Text::CapNotFound(&handle.0); KernelError::NoEnt }),
                None => Err({ let _ = Text::CapNotFound(&handle.0); KernelError::NoEnt })
            }
        })
    }

    /// Frees a reserved (unpublished) handle so a future `cap_alloc` can reuse its index.
    pub fn cap_free(&self, handle: Handle) -> KernelResult<()> {
        self.with_slots(|slots| {
            match slots.get_mut(handle.0 as usize) {
                Some(slot @ Slot::Reserved) => { *slot = Slot::Free; Ok(()) },
                Some(Slot::Published(_)) => Err(KernelError::Inval),
                _ => Err({ let _ = Text::CapNotFound(&handle.0); KernelError::NoEnt })
            }
        })
    }

    /// A type-checked lookup: returns the published object at `handle` if it exists and its kind
    /// matches `expected`. A kind mismatch is reported as `KernelError::Inval`
    /// (`Text::CapWrongKind`), never a panic -- this is a protocol error a misbehaving or
    /// confused userspace program can trigger at will.
    pub fn kobject_get(&self, handle: Handle, expected: KObjectKind) -> KernelResult<Arc<dyn KObject>> {
        self.with_slots(|slots| {
            match slots.get(handle.0 as usize) {
                Some(Slot::Published(kobj)) => {
                    if kobj.kind() == expected {
                        Ok(Arc::clone(kobj))
                    } else {
                        Err({ let _ = Text::CapWrongKind; KernelError::Inval })
                    }
                },
                _ => Err({ let _ = Text::CapNotFound(&handle.0); KernelError::NoEnt })
            }
        })
    }

    /// Walks every live capability (in any state but `Free`), running each published object's
    /// `on_revoke` before dropping the table's reference and freeing the slot. Called once, by
    /// `kernel-task`, when a task exits.
    pub fn sweep(&self) {
        self.with_slots(|slots| {
            for slot in slots.iter_mut() {
                if let Slot::Published(kobj) = slot {
                    kobj.on_revoke();
                }
                *slot = Slot::Free;
            }
            slots.clear();
        });
    }
}

impl KObject for waitq::Waitq {
    fn kind(&self) -> KObjectKind {
        KObjectKind::Waitq
    }

    fn on_revoke(&self) {
        // Mirrors `Phone::hangup`: revoking a published waitq must not leave anything blocked on
        // it forever, so every sleeper is kicked awake rather than left to time out on its own.
        self.wakeup(waitq::WakeMode::All);
    }
}

impl KObject for address_space::Area {
    fn kind(&self) -> KObjectKind {
        KObjectKind::Area
    }

    // An area published into a capability table has no sleeper and no routing state to unwind;
    // revoking the capability just stops userspace from naming it again. The area itself, and
    // whatever it still has mapped, lives on until its owning address space goes away.
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Toy { revoked: AtomicUsize }
    impl KObject for Toy {
        fn kind(&self) -> KObjectKind { KObjectKind::Other("toy") }
        fn on_revoke(&self) { self.revoked.fetch_add(1, Ordering::AcqRel); }
    }

    #[test]
    fn alloc_publish_unpublish_round_trips() {
        let table = CapTable::new();
        let handle = table.cap_alloc();
        let toy: Arc<dyn KObject> = Arc::new(Toy { revoked: AtomicUsize::new(0) });
        table.cap_publish(handle, Arc::clone(&toy)).unwrap();

        let got = table.kobject_get(handle, KObjectKind::Other("toy")).unwrap();
        assert!(Arc::ptr_eq(&got, &toy));

        let back = table.cap_unpublish(handle).unwrap();
        assert!(Arc::ptr_eq(&back, &toy));
        assert!(table.kobject_get(handle, KObjectKind::Other("toy")).is_err());

        table.cap_free(handle).unwrap();
        let handle2 = table.cap_alloc();
        assert_eq!(handle2, handle, "freed handle should be reused before growing the table");
    }

    #[test]
    fn wrong_kind_is_an_error_not_a_panic() {
        let table = CapTable::new();
        let handle = table.cap_alloc();
        let toy: Arc<dyn KObject> = Arc::new(Toy { revoked: AtomicUsize::new(0) });
        table.cap_publish(handle, toy).unwrap();
        assert_eq!(table.kobject_get(handle, KObjectKind::Phone), Err(KernelError::Inval));
    }

    #[test]
    fn sweep_revokes_every_published_object() {
        let table = CapTable::new();
        let toy = Arc::new(Toy { revoked: AtomicUsize::new(0) });
        let handle = table.cap_alloc();
        table.cap_publish(handle, toy.clone() as Arc<dyn KObject>).unwrap();

        table.sweep();
        assert_eq!(toy.revoked.load(Ordering::Acquire), 1);
        assert!(table.kobject_get(handle, KObjectKind::Other("toy")).is_err());
    }

    #[test]
    fn missing_handle_is_no_ent() {
        let table = CapTable::new();
        assert_eq!(table.kobject_get(Handle(42), KObjectKind::Phone), Err(KernelError::NoEnt));
    }
}
