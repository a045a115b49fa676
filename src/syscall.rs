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

//! The stable syscall surface: one numeric ID per operation, six-word arguments in, six-word
//! results out, matching the register convention architecture-specific trap glue hands off to
//! [`dispatch`].
//!
//! Two return conventions share the six result words, chosen per call the same way a real ABI
//! reserves its error slot:
//!
//! - Most calls use the *generic* convention: word 0 is `0` on success or one of the codes below
//!   `ERROR_BASE` + an offset on failure, and any payload follows in words 1..6.
//! - The synchronous/asynchronous IPC calls pass through the six-word call tuple verbatim instead
//!   (word 0 there is the callee's own `retval`, not a kernel error), so a kernel-level failure is
//!   signaled the same way a negative errno shares a register with a success value on other
//!   kernels: as a sentinel at the top of `usize`'s range, away from any value `retval` can
//!   legitimately take. `ERROR_BASE` is that sentinel.
//!
//! `_SLOW` variants exist for calls whose full argument or result tuple doesn't fit in six
//! registers; they exchange one register for a pointer to that tuple in the caller's own address
//! space. This crate doesn't validate that pointer against the caller's address space (no
//! `copy_from_user` primitive exists below this layer) -- the same identity-mapped-memory
//! shortcut the rest of this crate takes for kernel stacks and ELF images.

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use address_space::{Anonymous, AreaFlags};
use cap::{CapTable, Handle, KObject, KObjectKind};
use error::{KernelError, KernelResult};
use ipc::{Call, IPC_CALL_LEN, IPC_M_CONNECT_TO_ME, Phone};
use locks::Mutex;
use task::{Task, Thread, ThreadFlags};
use waitq::{WakeMode, WaitqFlags, Waitq};

use crate::TargetArch;

/// Places a synchronous call, registers carrying the full six-word tuple.
pub const IPC_CALL_SYNC_FAST: usize = 1;
/// Places a synchronous call, the six-word tuple read from a pointer.
pub const IPC_CALL_SYNC_SLOW: usize = 2;
/// Places an asynchronous call, registers carrying the tuple.
pub const IPC_CALL_ASYNC_FAST: usize = 3;
/// Places an asynchronous call, the tuple read from a pointer.
pub const IPC_CALL_ASYNC_SLOW: usize = 4;
/// Answers a previously received call, registers carrying the reply.
pub const IPC_ANSWER_FAST: usize = 5;
/// Answers a previously received call, the reply read from a pointer.
pub const IPC_ANSWER_SLOW: usize = 6;
/// Re-routes a previously received call to a different phone instead of answering it.
pub const IPC_FORWARD_FAST: usize = 7;
/// Same as [`IPC_FORWARD_FAST`]; forwarding carries no extra payload, so the two are identical.
pub const IPC_FORWARD_SLOW: usize = 8;
/// Blocks for the next call or notification addressed to the caller's task.
pub const IPC_WAIT: usize = 9;
/// Closes a phone.
pub const IPC_HANGUP: usize = 10;
/// Asks a phone's target to call back through a freshly created phone of the caller's own.
pub const IPC_CONNECT_TO_ME: usize = 11;
/// Creates a new phone to whatever a given phone is already connected to.
pub const IPC_CONNECT_ME_TO: usize = 12;
/// Maps a new area into the caller's address space.
pub const AS_AREA_CREATE: usize = 13;
/// Grows or shrinks an existing area.
pub const AS_AREA_RESIZE: usize = 14;
/// Unmaps an area.
pub const AS_AREA_DESTROY: usize = 15;
/// Changes an existing area's permission flags.
pub const AS_AREA_CHANGE_FLAGS: usize = 16;
/// Spawns an additional thread into the caller's task.
pub const THREAD_CREATE: usize = 17;
/// Terminates the calling thread.
pub const THREAD_EXIT: usize = 18;
/// Returns the calling thread's ID.
pub const THREAD_GET_ID: usize = 19;
/// Returns the calling task's ID.
pub const TASK_GET_ID: usize = 20;
/// Terminates the calling task.
pub const TASK_EXIT: usize = 21;
/// Creates a new waitq, published into the caller's capability table.
pub const WAITQ_CREATE: usize = 22;
/// Blocks on a waitq.
pub const WAITQ_SLEEP: usize = 23;
/// Wakes one or all sleepers on a waitq.
pub const WAITQ_WAKEUP: usize = 24;
/// Destroys a waitq, waking every sleeper with an error first.
pub const WAITQ_DESTROY: usize = 25;
/// Reserved for symmetry with [`CAP_UNPUBLISH`]; every object this kernel can publish is created
/// already published by its own subsystem call (`AS_AREA_CREATE`, `WAITQ_CREATE`, ...), so this
/// always fails with `NotSup` rather than taking an object it has no way to name generically.
pub const CAP_PUBLISH: usize = 26;
/// Revokes any capability by handle, regardless of its kind.
pub const CAP_UNPUBLISH: usize = 27;

/// The high end of `usize`'s range, reserved for encoding a kernel error into an IPC call's
/// `retval` word. No legitimate application reply code is expected to land here; see the module
/// documentation.
const ERROR_BASE: usize = usize::MAX - 16;

fn error_code(e: KernelError) -> usize {
    ERROR_BASE + match e {
        KernelError::NoMem => 1,
        KernelError::Inval => 2,
        KernelError::NoEnt => 3,
        KernelError::Limit => 4,
        KernelError::Hangup => 5,
        KernelError::Intr => 6,
        KernelError::Timeout => 7,
        KernelError::Overflow => 8,
        KernelError::NotSup => 9
    }
}

fn ok(payload: [usize; 5]) -> [usize; 6] {
    [0, payload[0], payload[1], payload[2], payload[3], payload[4]]
}

fn ok1(word: usize) -> [usize; 6] {
    ok([word, 0, 0, 0, 0])
}

fn err(e: KernelError) -> [usize; 6] {
    [error_code(e), 0, 0, 0, 0, 0]
}

fn from_result(r: KernelResult<[usize; 5]>) -> [usize; 6] {
    match r {
        Ok(payload) => ok(payload),
        Err(e) => err(e)
    }
}

fn from_unit_result(r: KernelResult<()>) -> [usize; 6] {
    from_result(r.map(|()| [0; 5]))
}

/// Received calls this syscall layer has handed to userspace via `IPC_WAIT` and is holding onto
/// until the matching `IPC_ANSWER`/`IPC_FORWARD`. Nothing in `kernel-cap`'s `KObjectKind` names an
/// in-flight call (it isn't an object a task ever publishes), so this keeps its own side table --
/// the same pattern `kernel-task` uses for `waitq` sleep tickets it's holding on behalf of a
/// sleeping thread.
static DISPATCHED_CALLS: Mutex<BTreeMap<u64, Arc<Call>>> = Mutex::new(BTreeMap::new());
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

fn stash_call(call: Arc<Call>) -> u64 {
    let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
    loop {
        if let Ok(mut calls) = DISPATCHED_CALLS.try_lock() {
            calls.insert(id, call);
            return id;
        }
    }
}

fn take_call(id: u64) -> KernelResult<Arc<Call>> {
    loop {
        if let Ok(mut calls) = DISPATCHED_CALLS.try_lock() {
            return calls.remove(&id).ok_or(KernelError::NoEnt);
        }
    }
}

/// Reads a six-word call tuple out of a `_SLOW` variant's pointer argument.
///
/// # Safety
/// See the module documentation: `ptr` is trusted, not validated against the caller's address
/// space.
unsafe fn read_words(ptr: usize) -> [usize; IPC_CALL_LEN] {
    *(ptr as *const [usize; IPC_CALL_LEN])
}

/// Writes a six-word call tuple back through a `_SLOW` variant's pointer argument.
///
/// # Safety
/// Same caveat as [`read_words`].
unsafe fn write_words(ptr: usize, words: [usize; IPC_CALL_LEN]) {
    *(ptr as *mut [usize; IPC_CALL_LEN]) = words;
}

fn current_thread() -> Arc<Thread<TargetArch>> {
    crate::task_system().current(TargetArch::cpu_index())
        .expect("a syscall trap must always have a current thread")
}

fn current_task() -> Arc<Task<TargetArch>> {
    Arc::clone(current_thread().task())
}

fn phone_at(table: &CapTable, handle: usize) -> KernelResult<Arc<Phone>> {
    let kobj = table.kobject_get(Handle(handle as u32), KObjectKind::Phone)?;
    <dyn KObject>::downcast_arc::<Phone>(kobj).map_err(|_| KernelError::Inval)
}

fn waitq_at(table: &CapTable, handle: usize) -> KernelResult<Arc<Waitq>> {
    let kobj = table.kobject_get(Handle(handle as u32), KObjectKind::Waitq)?;
    <dyn KObject>::downcast_arc::<Waitq>(kobj).map_err(|_| KernelError::Inval)
}

fn area_at(table: &CapTable, handle: usize) -> KernelResult<Arc<address_space::Area>> {
    let kobj = table.kobject_get(Handle(handle as u32), KObjectKind::Area)?;
    <dyn KObject>::downcast_arc::<address_space::Area>(kobj).map_err(|_| KernelError::Inval)
}

fn publish(table: &CapTable, kobj: Arc<dyn KObject>) -> KernelResult<Handle> {
    let handle = table.cap_alloc();
    table.cap_publish(handle, kobj)?;
    Ok(handle)
}

fn ipc_call_sync(args: [usize; 6], slow: bool) -> [usize; 6] {
    let task = current_task();
    let phone = match phone_at(task.captable(), args[0]) {
        Ok(p) => p,
        Err(e) => return err(e)
    };
    let words = if slow {
        unsafe { read_words(args[1]) }
    } else {
        [args[1], args[2], args[3], args[4], args[5], 0]
    };
    let reply_box = task.answerbox().clone();
    match ipc::ipc_call_sync(&phone, task.id(), reply_box, words) {
        Ok(answer) => {
            if slow {
                unsafe { write_words(args[1], answer) };
                ok([0; 5])
            } else {
                answer
            }
        }
        Err(e) => err(e)
    }
}

fn ipc_call_async(args: [usize; 6], slow: bool) -> [usize; 6] {
    let task = current_task();
    let phone = match phone_at(task.captable(), args[0]) {
        Ok(p) => p,
        Err(e) => return err(e)
    };
    let words = if slow {
        unsafe { read_words(args[1]) }
    } else {
        [args[1], args[2], args[3], args[4], args[5], 0]
    };
    let reply_box = task.answerbox().clone();
    let result = ipc::ipc_call_async(&phone, task.id(), reply_box, words);
    from_unit_result(result.map(|_call| ()))
}

fn ipc_answer(args: [usize; 6], slow: bool) -> [usize; 6] {
    let call = match take_call(args[0] as u64) {
        Ok(c) => c,
        Err(e) => return err(e)
    };
    let (retval, answer_args) = if slow {
        let words = unsafe { read_words(args[1]) };
        (words[0], [words[1], words[2], words[3], words[4], words[5]])
    } else {
        (args[1], [args[2], args[3], args[4], args[5], 0])
    };
    let box_ = current_task().answerbox().clone();
    from_unit_result(ipc::ipc_answer(&box_, call, retval, answer_args))
}

fn ipc_forward(args: [usize; 6]) -> [usize; 6] {
    let call = match take_call(args[0] as u64) {
        Ok(c) => c,
        Err(e) => return err(e)
    };
    let task = current_task();
    let new_target_phone = match phone_at(task.captable(), args[1]) {
        Ok(p) => p,
        Err(e) => return err(e)
    };
    let new_target = match new_target_phone.target() {
        Some(t) => t,
        None => return err(KernelError::Hangup)
    };
    let route_from_me = if args[2] == 0 {
        None
    } else {
        match phone_at(task.captable(), args[2]) {
            Ok(p) => Some(p),
            Err(e) => return err(e)
        }
    };
    let box_ = task.answerbox().clone();
    from_unit_result(ipc::ipc_forward(&box_, call, &new_target, route_from_me))
}

fn ipc_wait(args: [usize; 6]) -> [usize; 6] {
    let out_ptr = args[0];
    let timeout_usec = args[1] as u64;
    let box_ = current_task().answerbox().clone();
    match ipc::ipc_receive(&box_, timeout_usec) {
        Ok(call) => {
            unsafe { write_words(out_ptr, call.words()) };
            let id = stash_call(call);
            ok1(id as usize)
        }
        Err(e) => err(e)
    }
}

fn ipc_hangup(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    match phone_at(task.captable(), args[0]) {
        Ok(phone) => { phone.hangup(); from_unit_result(Ok(())) }
        Err(e) => err(e)
    }
}

fn ipc_connect_to_me(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let target_phone = match phone_at(task.captable(), args[0]) {
        Ok(p) => p,
        Err(e) => return err(e)
    };
    let callback = ipc::connect(task.answerbox().clone());
    let handle = match publish(task.captable(), callback.clone() as Arc<dyn KObject>) {
        Ok(h) => h,
        Err(e) => return err(e)
    };
    let reply_box = task.answerbox().clone();
    let words = [IPC_M_CONNECT_TO_ME as usize, handle.0 as usize, 0, 0, 0, 0];
    match ipc::ipc_call_async(&target_phone, task.id(), reply_box, words) {
        Ok(_) => ok1(handle.0 as usize),
        Err(e) => err(e)
    }
}

fn ipc_connect_me_to(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let phone = match phone_at(task.captable(), args[0]) {
        Ok(p) => p,
        Err(e) => return err(e)
    };
    let target = match phone.target() {
        Some(t) => t,
        None => return err(KernelError::Hangup)
    };
    let new_phone = ipc::connect(target);
    match publish(task.captable(), new_phone as Arc<dyn KObject>) {
        Ok(h) => ok1(h.0 as usize),
        Err(e) => err(e)
    }
}

fn as_area_create(args: [usize; 6]) -> [usize; 6] {
    let base = args[0];
    let size = args[1];
    let flags = AreaFlags::from_bits_truncate(args[2] as u32);
    let task = current_task();
    match task.address_space().area_create(base, size, flags, Arc::new(Anonymous)) {
        Ok(area) => match publish(task.captable(), area as Arc<dyn KObject>) {
            Ok(h) => ok1(h.0 as usize),
            Err(e) => err(e)
        },
        Err(e) => err(e)
    }
}

fn as_area_resize(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    match area_at(task.captable(), args[0]) {
        Ok(area) => from_unit_result(area.resize(args[1])),
        Err(e) => err(e)
    }
}

fn as_area_destroy(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let table = task.captable();
    let area = match area_at(table, args[0]) {
        Ok(a) => a,
        Err(e) => return err(e)
    };
    if let Err(e) = table.cap_unpublish(Handle(args[0] as u32)) {
        return err(e);
    }
    let _ = table.cap_free(Handle(args[0] as u32));
    task.address_space().area_destroy(&area);
    from_unit_result(Ok(()))
}

fn as_area_change_flags(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    match area_at(task.captable(), args[0]) {
        Ok(area) => {
            task.address_space().area_change_flags(&area, AreaFlags::from_bits_truncate(args[1] as u32));
            from_unit_result(Ok(()))
        }
        Err(e) => err(e)
    }
}

fn thread_create(args: [usize; 6]) -> [usize; 6] {
    let entry: extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(args[0]) };
    let arg = args[1];
    let priority = args[2] as u8;
    let cpu = args[3];
    let flags = ThreadFlags::from_bits_truncate(args[4] as u32) | ThreadFlags::USPACE;
    let task = current_task();
    match crate::task_system().spawn_thread(&task, cpu, priority, flags, entry, arg) {
        Ok(thread) => ok1(thread.id().0 as usize),
        Err(e) => err(e)
    }
}

fn thread_exit() -> ! {
    crate::task_system().thread_exit(TargetArch::cpu_index())
}

fn thread_get_id() -> [usize; 6] {
    ok1(current_thread().id().0 as usize)
}

fn task_get_id() -> [usize; 6] {
    ok1(current_task().id().0 as usize)
}

fn waitq_create() -> [usize; 6] {
    let task = current_task();
    let wq: Arc<Waitq> = Arc::new(Waitq::new(false));
    match publish(task.captable(), wq as Arc<dyn KObject>) {
        Ok(h) => ok1(h.0 as usize),
        Err(e) => err(e)
    }
}

fn waitq_sleep(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let wq = match waitq_at(task.captable(), args[0]) {
        Ok(w) => w,
        Err(e) => return err(e)
    };
    let timeout_usec = args[1] as u64;
    let flags = WaitqFlags::from_bits_truncate(args[2] as u32);
    match waitq::waitq_sleep_timeout(&wq, timeout_usec, flags) {
        waitq::WakeReason::Woken => from_unit_result(Ok(())),
        waitq::WakeReason::TimedOut => err(KernelError::Timeout),
        waitq::WakeReason::Interrupted => err(KernelError::Intr)
    }
}

fn waitq_wakeup(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let wq = match waitq_at(task.captable(), args[0]) {
        Ok(w) => w,
        Err(e) => return err(e)
    };
    let mode = if args[1] == 0 { WakeMode::First } else { WakeMode::All };
    ok1(waitq::waitq_wakeup(&wq, mode))
}

fn waitq_destroy(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let table = task.captable();
    let handle = Handle(args[0] as u32);
    if let Err(e) = table.kobject_get(handle, KObjectKind::Waitq) {
        return err(e);
    }
    match table.cap_unpublish(handle) {
        Ok(kobj) => {
            kobj.on_revoke();
            let _ = table.cap_free(handle);
            from_unit_result(Ok(()))
        }
        Err(e) => err(e)
    }
}

fn cap_unpublish(args: [usize; 6]) -> [usize; 6] {
    let task = current_task();
    let table = task.captable();
    let handle = Handle(args[0] as u32);
    match table.cap_unpublish(handle) {
        Ok(kobj) => {
            kobj.on_revoke();
            let _ = table.cap_free(handle);
            from_unit_result(Ok(()))
        }
        Err(e) => err(e)
    }
}

/// Routes one trapped syscall to the subsystem that implements it.
///
/// `nr` and `args` are exactly what architecture-specific trap glue read out of the calling
/// thread's registers; see the module documentation for how the six result words are filled in.
/// An unrecognized `nr` is reported as `KernelError::NotSup` rather than panicking -- userspace
/// controls this input completely.
pub fn dispatch(nr: usize, args: [usize; 6]) -> [usize; 6] {
    match nr {
        IPC_CALL_SYNC_FAST => ipc_call_sync(args, false),
        IPC_CALL_SYNC_SLOW => ipc_call_sync(args, true),
        IPC_CALL_ASYNC_FAST => ipc_call_async(args, false),
        IPC_CALL_ASYNC_SLOW => ipc_call_async(args, true),
        IPC_ANSWER_FAST => ipc_answer(args, false),
        IPC_ANSWER_SLOW => ipc_answer(args, true),
        IPC_FORWARD_FAST | IPC_FORWARD_SLOW => ipc_forward(args),
        IPC_WAIT => ipc_wait(args),
        IPC_HANGUP => ipc_hangup(args),
        IPC_CONNECT_TO_ME => ipc_connect_to_me(args),
        IPC_CONNECT_ME_TO => ipc_connect_me_to(args),
        AS_AREA_CREATE => as_area_create(args),
        AS_AREA_RESIZE => as_area_resize(args),
        AS_AREA_DESTROY => as_area_destroy(args),
        AS_AREA_CHANGE_FLAGS => as_area_change_flags(args),
        THREAD_CREATE => thread_create(args),
        THREAD_EXIT => thread_exit(),
        THREAD_GET_ID => thread_get_id(),
        TASK_GET_ID => task_get_id(),
        TASK_EXIT => thread_exit(),
        WAITQ_CREATE => waitq_create(),
        WAITQ_SLEEP => waitq_sleep(args),
        WAITQ_WAKEUP => waitq_wakeup(args),
        WAITQ_DESTROY => waitq_destroy(args),
        CAP_PUBLISH => err(KernelError::NotSup),
        CAP_UNPUBLISH => cap_unpublish(args),
        _ => err(KernelError::NotSup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_syscall_number_reports_not_supported() {
        assert_eq!(dispatch(9999, [0; 6]), err(KernelError::NotSup));
    }

    #[test]
    fn error_codes_stay_inside_the_reserved_sentinel_range() {
        let codes = [
            KernelError::NoMem, KernelError::Inval, KernelError::NoEnt, KernelError::Limit,
            KernelError::Hangup, KernelError::Intr, KernelError::Timeout, KernelError::Overflow,
            KernelError::NotSup
        ];
        for code in codes {
            assert!(error_code(code) > ERROR_BASE);
            assert!(error_code(code) < usize::MAX);
        }
    }

    #[test]
    fn ok1_leaves_the_trailing_payload_words_zeroed() {
        assert_eq!(ok1(42), [0, 42, 0, 0, 0, 0]);
    }

    #[test]
    fn cap_unpublish_on_an_unknown_handle_is_not_found() {
        // Exercised indirectly: a handle nothing ever published can't resolve through
        // `CapTable::cap_unpublish`, regardless of which task is current.
        let table = CapTable::new();
        assert_eq!(table.cap_unpublish(Handle(12345)).err(), Some(KernelError::NoEnt));
    }
}
