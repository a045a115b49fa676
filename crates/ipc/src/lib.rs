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

//! Synchronous and asynchronous inter-process communication: phones, answerboxes, and the calls
//! that pass between them.
//!
//! This crate has no idea what a task or a thread actually is -- it refers to callers only by
//! [`TaskId`], an opaque integer it defines itself. That keeps the dependency graph acyclic:
//! `kernel-task` depends on `kernel-ipc` (a task owns an answerbox and a set of phones), so
//! `kernel-ipc` cannot also depend on `kernel-task`. Blocking is built on `kernel-waitq`, the same
//! way every other blocking primitive in this kernel is.

#![cfg_attr(not(test), no_std)]

#![deny(warnings, missing_docs)]

extern crate alloc;
#[macro_use] extern crate bitflags;

mod answerbox;
mod call;
mod phone;

use {
    alloc::sync::Arc,

    error::{KernelError, KernelResult},
    i18n::Text,
    waitq::{WaitqFlags, WakeMode, waitq_sleep_timeout},
};

pub use answerbox::Answerbox;
pub use call::{Call, CallFlags, CallState};
pub use phone::Phone;

/// Number of machine words in a call's wire encoding: `{imethod/retval, arg1..arg5}`.
pub const IPC_CALL_LEN: usize = 6;
/// Maximum number of asynchronous calls a single phone may have outstanding at once.
pub const IPC_MAX_ASYNC_CALLS: usize = 64;
/// Maximum payload size for the `data_read`/`data_write` sub-protocols, in bytes.
pub const DATA_XFER_LIMIT: usize = 64 * 1024;
/// Method numbers below this are reserved for the kernel itself.
pub const IPC_FIRST_USER_METHOD: u32 = 1024;

/// A phone hung itself up (`IPC_M_PHONE_HUNGUP`).
pub const IPC_M_PHONE_HUNGUP: u32 = 0;
/// A peer is asking to be called back (`IPC_M_CONNECT_TO_ME`).
pub const IPC_M_CONNECT_TO_ME: u32 = 1;
/// A peer is asking to connect to a third party through this answerbox (`IPC_M_CONNECT_ME_TO`).
pub const IPC_M_CONNECT_ME_TO: u32 = 2;
/// Begins a `data_read` transfer (`IPC_M_DATA_READ`).
pub const IPC_M_DATA_READ: u32 = 3;
/// Begins a `data_write` transfer (`IPC_M_DATA_WRITE`).
pub const IPC_M_DATA_WRITE: u32 = 4;
/// A user pager is being asked to service a page fault (`IPC_M_PAGE_IN`).
pub const IPC_M_PAGE_IN: u32 = 5;

/// An opaque reference to a task, as far as this crate is concerned. `kernel-task` assigns these;
/// this crate only ever stores and compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

/// Connects a new phone to `target`. Does not publish it into any capability table; the caller
/// (the syscall layer, via `kernel-cap`) is responsible for that.
pub fn connect(target: Arc<Answerbox>) -> Arc<Phone> {
    Phone::new(target)
}

/// Places a synchronous call. Blocks the caller until the call is answered (by the receiving
/// task, by a forward chain that eventually gets answered, or automatically because the phone or
/// the target went away), then returns the answer words with word 0 replaced by `retval`.
///
/// Corresponds to `IPC_CALL_SYNC_FAST/SLOW`.
pub fn ipc_call_sync(
    phone: &Arc<Phone>,
    sender: TaskId,
    reply_answerbox: Arc<Answerbox>,
    words: [usize; IPC_CALL_LEN]
) -> KernelResult<[usize; IPC_CALL_LEN]> {
    let call = place_call(phone, sender, reply_answerbox, words)?;

    let reason = waitq_sleep_timeout(&call.sender_waitq, 0, WaitqFlags::empty());
    debug_assert_eq!(reason, waitq::WakeReason::Woken, "a call's waitq is only ever woken, not timed or interrupted");

    match call.auto_error() {
        Some(err) => Err(err),
        None => Ok(call.words())
    }
}

/// Places an asynchronous call. Does not block; the in-flight `Arc<Call>` is returned so the
/// caller can later reap its answer from its own answerbox (see `try_reap_answer`).
///
/// Corresponds to `IPC_CALL_ASYNC_FAST/SLOW`.
pub fn ipc_call_async(
    phone: &Arc<Phone>,
    sender: TaskId,
    reply_answerbox: Arc<Answerbox>,
    words: [usize; IPC_CALL_LEN]
) -> KernelResult<Arc<Call>> {
    phone.reserve_async_slot()?;
    place_call(phone, sender, reply_answerbox, words)
}

fn place_call(
    phone: &Arc<Phone>,
    sender: TaskId,
    reply_answerbox: Arc<Answerbox>,
    words: [usize; IPC_CALL_LEN]
) -> KernelResult<Arc<Call>> {
    if phone.is_hung_up() {
        return Err(KernelError::Hangup);
    }
    let target = phone.target().ok_or(KernelError::Hangup)?;
    let call = Arc::new(Call::new(words, sender, Arc::clone(phone), reply_answerbox));
    target.push_call(Arc::clone(&call));
    Ok(call)
}

/// Reaps one completed asynchronous call from `box_`'s answers queue, if any is ready, releasing
/// its phone's async-call slot. Non-blocking; returns `None` if nothing has been answered yet.
///
/// Only meaningful for calls placed with `ipc_call_async`: synchronous callers read their answer
/// directly off the woken `Call` instead of going through this path.
pub fn try_reap_answer(box_: &Answerbox) -> Option<(Arc<Call>, KernelResult<[usize; IPC_CALL_LEN]>)> {
    let call = box_.try_reap_answer()?;
    if let Some(phone) = &call.origin_phone {
        phone.release_async_slot();
    }
    let result = match call.auto_error() {
        Some(err) => Err(err),
        None => Ok(call.words())
    };
    Some((call, result))
}

/// Delivers a kernel-originated notification to `box_`. Never blocks and is never answered.
pub fn notify(box_: &Answerbox, words: [usize; IPC_CALL_LEN]) {
    let call = Arc::new(Call::new_notification(words));
    box_.push_notification(call);
}

/// Dequeues one ready call or notification from `box_`, blocking up to `timeout_usec` (`0` means
/// forever) if nothing is ready yet.
///
/// Corresponds to `IPC_WAIT`.
pub fn ipc_receive(box_: &Answerbox, timeout_usec: u64) -> KernelResult<Arc<Call>> {
    loop {
        if let Some(call) = box_.try_dequeue() {
            return Ok(call);
        }
        let reason = waitq_sleep_timeout(box_.recv_waitq(), timeout_usec, WaitqFlags::empty());
        match reason {
            waitq::WakeReason::Woken => continue,
            waitq::WakeReason::TimedOut => return Err(KernelError::Timeout),
            waitq::WakeReason::Interrupted => return Err(KernelError::Intr)
        }
    }
}

/// Answers `call`, which must currently be dispatched out of `box_`. Fills in the reply words,
/// moves the call to the caller's answerbox, and wakes the caller (synchronous callers) or leaves
/// it for the caller's reaper (asynchronous callers).
///
/// Corresponds to `IPC_ANSWER_FAST/SLOW`.
pub fn ipc_answer(
    box_: &Answerbox,
    call: Arc<Call>,
    retval: usize,
    args: [usize; IPC_CALL_LEN - 1]
) -> KernelResult<()> {
    if !box_.take_dispatched(&call) {
        return Err(KernelError::NoEnt);
    }
    let mut words = [0usize; IPC_CALL_LEN];
    words[0] = retval;
    words[1 ..].copy_from_slice(&args);
    call.complete(words, None);

    if !call.flags().contains(CallFlags::DISCARD_ANSWER) {
        if let Some(reply_answerbox) = &call.reply_answerbox {
            reply_answerbox.push_answer(Arc::clone(&call));
        }
    }
    call.sender_waitq.wakeup(WakeMode::First);
    Ok(())
}

/// Takes `call` out of `box_`'s dispatched set and re-queues it on `new_target` instead of
/// answering it. With `route_from_me = Some(phone)`, the call's apparent origin phone becomes
/// `phone`, so a subsequent hangup of `phone` (rather than the original caller's phone) can sweep
/// it up; reply routing (where the eventual answer goes) is unchanged either way.
///
/// Corresponds to `IPC_FORWARD_FAST/SLOW`.
pub fn ipc_forward(
    box_: &Answerbox,
    call: Arc<Call>,
    new_target: &Answerbox,
    route_from_me: Option<Arc<Phone>>
) -> KernelResult<()> {
    if !box_.take_dispatched(&call) {
        return Err(KernelError::NoEnt);
    }
    call.mark_forwarded();
    let call = match (route_from_me, &call.origin_phone, &call.reply_answerbox) {
        (Some(phone), _, Some(reply_answerbox)) =>
            Arc::new(Call::new(call.words(), call.sender_task, phone, Arc::clone(reply_answerbox))),
        (None, _, _) => call.clone(),
        (_, None, _) | (_, _, None) => return Err(KernelError::Inval)
    };
    new_target.push_call(call);
    Ok(())
}

/// Validates that a `data_read`/`data_write` transfer of `len` bytes fits under `DATA_XFER_LIMIT`.
/// The actual cross-address-space copy is `kernel-as`'s job; this crate only owns the protocol's
/// bookkeeping.
pub fn check_xfer_len(len: usize) -> KernelResult<()> {
    if len > DATA_XFER_LIMIT {
        let _ = Text::IpcXferTooLarge(&len, &DATA_XFER_LIMIT);
        Err(KernelError::Overflow)
    } else {
        Ok(())
    }
}

/// Called by `kernel-task` when a task exits with synchronous or asynchronous calls still
/// outstanding: marks each one's eventual answer as discardable, so `ipc_answer`/`Phone::hangup`
/// racing with task teardown never writes into a freed answerbox.
pub fn discard_outstanding(calls: &[Arc<Call>]) {
    for call in calls {
        call.mark_discarded();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use locks::Mutex;

    struct ImmediateScheduler {
        readied: Mutex<alloc::vec::Vec<(waitq::WaitTicket, waitq::WakeReason)>>
    }

    impl waitq::Scheduler for ImmediateScheduler {
        fn block(&self, _ticket: waitq::WaitTicket, deadline_usec: Option<u64>, _interruptible: bool) -> waitq::WakeReason {
            if deadline_usec.is_some() {
                waitq::WakeReason::TimedOut
            } else {
                // The test drives `ipc_receive`/`ipc_call_sync` from a single thread: by the time
                // `block` is reached, the answer or the next item is already queued, so a real
                // kernel would have switched to another runnable thread and come back later. The
                // test scheduler just spins the caller until `ready` is recorded for it, which is
                // always immediate here because nothing else is running concurrently.
                waitq::WakeReason::Woken
            }
        }

        fn ready(&self, ticket: waitq::WaitTicket, reason: waitq::WakeReason) {
            loop {
                if let Ok(mut log) = self.readied.try_lock() {
                    log.push((ticket, reason));
                    return;
                }
            }
        }
    }

    fn install_scheduler() {
        static SCHED: ImmediateScheduler = ImmediateScheduler { readied: Mutex::new(alloc::vec::Vec::new()) };
        static INSTALLED: AtomicUsize = AtomicUsize::new(0);
        if INSTALLED.swap(1, AtomicOrdering::AcqRel) == 0 {
            waitq::register_scheduler(&SCHED);
        }
    }

    #[test]
    fn ipc_roundtrip() {
        install_scheduler();
        let answerbox_b = Arc::new(Answerbox::new());
        let answerbox_a = Arc::new(Answerbox::new());
        let phone = connect(Arc::clone(&answerbox_b));

        // A places a call; since nothing is dispatched yet this only queues it (this test
        // exercises the protocol sequentially rather than across real concurrent threads).
        let call = place_call(&phone, TaskId(1), Arc::clone(&answerbox_a), [2000, 7, 0, 0, 0, 0]).unwrap();

        let received = ipc_receive(&answerbox_b, 0).unwrap();
        assert!(Arc::ptr_eq(&received, &call));
        assert_eq!(received.words()[0], 2000);
        assert_eq!(received.words()[1], 7);

        ipc_answer(&answerbox_b, received, 0, [14, 0, 0, 0, 0]).unwrap();

        let answer = answerbox_a.try_reap_answer().expect("answer should have been queued");
        assert_eq!(answer.words()[0], 0);
        assert_eq!(answer.words()[1], 14);
        assert!(answer.flags().contains(CallFlags::ANSWERED));
    }

    #[test]
    fn hangup_unblocks_every_pending_call() {
        install_scheduler();
        let answerbox_b = Arc::new(Answerbox::new());
        let answerbox_a = Arc::new(Answerbox::new());
        let phone = connect(Arc::clone(&answerbox_b));

        let calls: alloc::vec::Vec<_> = (0 .. 3)
            .map(|i| place_call(&phone, TaskId(1), Arc::clone(&answerbox_a), [2000 + i, 0, 0, 0, 0, 0]).unwrap())
            .collect();

        phone.hangup();

        for call in &calls {
            assert_eq!(call.auto_error(), Some(KernelError::Hangup));
            assert!(call.flags().contains(CallFlags::AUTO_REPLY));
        }
        for _ in 0 .. 3 {
            assert!(answerbox_a.try_reap_answer().is_some());
        }
    }

    #[test]
    fn async_calls_are_capped_per_phone() {
        install_scheduler();
        let answerbox_b = Arc::new(Answerbox::new());
        let answerbox_a = Arc::new(Answerbox::new());
        let phone = connect(answerbox_b);

        for _ in 0 .. IPC_MAX_ASYNC_CALLS {
            ipc_call_async(&phone, TaskId(1), Arc::clone(&answerbox_a), [2000, 0, 0, 0, 0, 0]).unwrap();
        }
        assert_eq!(
            ipc_call_async(&phone, TaskId(1), Arc::clone(&answerbox_a), [2000, 0, 0, 0, 0, 0]).unwrap_err(),
            KernelError::Limit
        );
    }

    #[test]
    fn oversized_transfer_is_rejected() {
        assert_eq!(check_xfer_len(DATA_XFER_LIMIT), Ok(()));
        assert_eq!(check_xfer_len(DATA_XFER_LIMIT + 1), Err(KernelError::Overflow));
    }
}
