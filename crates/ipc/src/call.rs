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

//! A single in-flight IPC message and its routing metadata.

use {
    alloc::sync::Arc,

    error::KernelError,
    locks::Mutex,
    waitq::Waitq,

    crate::{IPC_CALL_LEN, TaskId, phone::Phone}
};

bitflags! {
    /// Flags carried alongside a call's six data words.
    pub struct CallFlags: u32 {
        /// The call has received an answer (real or auto-generated).
        const ANSWERED       = 0b0000_0001;
        /// The caller has abandoned this call; when an answer does arrive, it should be dropped
        /// instead of being queued to the caller's answerbox (set when the caller's task exits
        /// with calls still outstanding).
        const DISCARD_ANSWER = 0b0000_0010;
        /// The call has been routed to a different answerbox at least once via `ipc_forward`.
        const FORWARDED      = 0b0000_0100;
        /// A kernel-originated notification: never blocks its sender and can never be answered.
        const NOTIF          = 0b0000_1000;
        /// The answer was generated by the kernel itself (e.g. a hangup sweep), not by the
        /// receiving task calling `ipc_answer`.
        const AUTO_REPLY     = 0b0001_0000;
    }
}

/// Where a call currently sits. Every live call is in exactly one of these states, matching
/// whichever of the three queues (target's `calls`, target's `dispatched`, caller's `answers`)
/// currently holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Queued on the target answerbox, waiting for `ipc_receive`.
    Queued,
    /// Handed to a receiver by `ipc_receive`, awaiting `ipc_answer` or `ipc_forward`.
    Dispatched,
    /// Answered; queued on the caller's answerbox for the caller (or its async reaper) to read.
    Answered
}

struct CallData {
    words: [usize; IPC_CALL_LEN],
    flags: CallFlags,
    state: CallState,
    /// Set instead of a real answer when the kernel completes this call on the target's behalf
    /// (currently only a phone hangup sweep).
    auto_error: Option<KernelError>
}

/// A single six-word IPC message plus routing metadata. Referenced by `Arc` from whichever queue
/// currently holds it and, for synchronous calls, from the sender's stack while it blocks.
pub struct Call {
    data: Mutex<CallData>,
    /// The task that placed this call, recorded for diagnostics and for the task-exit sweep that
    /// marks outstanding calls `DISCARD_ANSWER`.
    pub sender_task: TaskId,
    /// The phone this call was placed through, if any. Used by `ipc_forward`'s `ROUTE_FROM_ME`
    /// mode and by the phone's in-flight accounting. `None` only for kernel notifications, which
    /// have no sender-side phone to hang up.
    pub origin_phone: Option<Arc<Phone>>,
    /// The answerbox an answer to this call should land in: the caller's own answerbox, fixed at
    /// creation. Forwarding changes the *target* the call is dispatched to, never this. `None` for
    /// notifications, which are never answered.
    pub reply_answerbox: Option<Arc<crate::answerbox::Answerbox>>,
    /// Where the sender is blocked (synchronous calls) or will next look (asynchronous calls).
    /// Non-permanent: a sleeper always arrives after the call object exists, so a wakeup never
    /// needs to be banked.
    pub sender_waitq: Waitq
}

impl Call {
    /// Creates a new call, queued, carrying `words`.
    pub fn new(
        words: [usize; IPC_CALL_LEN],
        sender_task: TaskId,
        origin_phone: Arc<Phone>,
        reply_answerbox: Arc<crate::answerbox::Answerbox>
    ) -> Call {
        Call {
            data: Mutex::new(CallData {
                words,
                flags: CallFlags::empty(),
                state: CallState::Queued,
                auto_error: None
            }),
            sender_task,
            origin_phone: Some(origin_phone),
            reply_answerbox: Some(reply_answerbox),
            sender_waitq: Waitq::new(false)
        }
    }

    /// Creates a notification: flagged `NOTIF`, with no sender to ever wake and no reply route.
    pub fn new_notification(words: [usize; IPC_CALL_LEN]) -> Call {
        Call {
            data: Mutex::new(CallData {
                words,
                flags: CallFlags::NOTIF,
                state: CallState::Queued,
                auto_error: None
            }),
            sender_task: TaskId(0),
            origin_phone: None,
            reply_answerbox: None,
            sender_waitq: Waitq::new(false)
        }
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut CallData) -> R) -> R {
        loop {
            if let Ok(mut data) = self.data.try_lock() {
                return f(&mut data);
            }
        }
    }

    /// The call's current state.
    pub fn state(&self) -> CallState {
        self.with_data(|d| d.state)
    }

    /// This call's flags as of right now.
    pub fn flags(&self) -> CallFlags {
        self.with_data(|d| d.flags)
    }

    /// Copies out the six data words as of right now.
    pub fn words(&self) -> [usize; IPC_CALL_LEN] {
        self.with_data(|d| d.words)
    }

    /// Transitions `Queued -> Dispatched`.
    pub fn mark_dispatched(&self) {
        self.with_data(|d| d.state = CallState::Dispatched);
    }

    /// Fills in the answer words and transitions `Dispatched -> Answered`, setting `ANSWERED` and,
    /// if this is a kernel-generated completion, `AUTO_REPLY` plus the error it carries.
    pub fn complete(&self, words: [usize; IPC_CALL_LEN], auto_error: Option<KernelError>) {
        self.with_data(|d| {
            d.words = words;
            d.flags |= CallFlags::ANSWERED;
            if auto_error.is_some() {
                d.flags |= CallFlags::AUTO_REPLY;
            }
            d.auto_error = auto_error;
            d.state = CallState::Answered;
        });
    }

    /// Marks this call forwarded, resetting it to `Queued` for re-delivery to a new target.
    pub fn mark_forwarded(&self) {
        self.with_data(|d| {
            d.flags |= CallFlags::FORWARDED;
            d.state = CallState::Queued;
        });
    }

    /// Marks this call's eventual answer as one the caller no longer cares about (the caller's
    /// task exited while the call was still outstanding).
    pub fn mark_discarded(&self) {
        self.with_data(|d| d.flags |= CallFlags::DISCARD_ANSWER);
    }

    /// The error an auto-generated answer carries, if any. `Ok` words should be used verbatim when
    /// this is `None`.
    pub fn auto_error(&self) -> Option<KernelError> {
        self.with_data(|d| d.auto_error)
    }
}
