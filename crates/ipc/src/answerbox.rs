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

//! The queue set owned by a task (or kernel subsystem) that every IPC call it's party to passes
//! through.

use {
    alloc::{collections::VecDeque, sync::Arc, vec::Vec},

    locks::Mutex,
    waitq::Waitq,

    crate::call::Call
};

/// Incoming calls, calls handed out to a handler, outgoing answers, and kernel notifications, plus
/// the waitq a receiver blocks on when none of the first two are ready.
///
/// Lock order, per spec: `phone.lock -> answerbox.lock` on send, `answerbox.lock -> call.lock` on
/// receive. This type's four queues share one internal lock each (not one lock for the whole box)
/// so that `ipc_answer` delivering into a *different* answerbox's `answers` queue never has to
/// wait on that answerbox's `calls`/`dispatched` traffic.
pub struct Answerbox {
    calls: Mutex<VecDeque<Arc<Call>>>,
    dispatched: Mutex<Vec<Arc<Call>>>,
    answers: Mutex<VecDeque<Arc<Call>>>,
    notifications: Mutex<VecDeque<Arc<Call>>>,
    /// Permanent: a wakeup delivered just before `ipc_receive` starts sleeping must not be lost.
    recv_waitq: Waitq
}

impl Answerbox {
    /// An empty answerbox.
    pub const fn new() -> Answerbox {
        Answerbox {
            calls: Mutex::new(VecDeque::new()),
            dispatched: Mutex::new(Vec::new()),
            answers: Mutex::new(VecDeque::new()),
            notifications: Mutex::new(VecDeque::new()),
            recv_waitq: Waitq::new(true)
        }
    }

    fn with<T>(lock: &Mutex<T>, f: impl FnOnce(&mut T) -> ()) {
        loop {
            if let Ok(mut guard) = lock.try_lock() {
                f(&mut guard);
                return;
            }
        }
    }

    pub(crate) fn push_call(&self, call: Arc<Call>) {
        Self::with(&self.calls, |q| q.push_back(call));
        self.recv_waitq.wakeup(waitq::WakeMode::First);
    }

    pub(crate) fn push_notification(&self, call: Arc<Call>) {
        Self::with(&self.notifications, |q| q.push_back(call));
        self.recv_waitq.wakeup(waitq::WakeMode::First);
    }

    pub(crate) fn push_answer(&self, call: Arc<Call>) {
        Self::with(&self.answers, |q| q.push_back(call));
    }

    /// Pops one ready item (a notification, if any, else the oldest call), moving it into
    /// `dispatched`. `None` means nothing is ready right now.
    pub(crate) fn try_dequeue(&self) -> Option<Arc<Call>> {
        let call = {
            let mut popped = None;
            Self::with(&self.notifications, |q| popped = q.pop_front());
            if popped.is_none() {
                Self::with(&self.calls, |q| popped = q.pop_front());
            }
            popped
        }?;
        if !call.flags().contains(crate::call::CallFlags::NOTIF) {
            call.mark_dispatched();
            Self::with(&self.dispatched, |d| d.push(Arc::clone(&call)));
        }
        Some(call)
    }

    /// The receiver's blocking point: call after every failed `try_dequeue` to wait for the next
    /// push.
    pub(crate) fn recv_waitq(&self) -> &Waitq {
        &self.recv_waitq
    }

    /// Removes `call` from `dispatched`, if it's there. Used by `ipc_answer`/`ipc_forward`.
    pub(crate) fn take_dispatched(&self, call: &Arc<Call>) -> bool {
        let mut found = false;
        Self::with(&self.dispatched, |d| {
            if let Some(pos) = d.iter().position(|c| Arc::ptr_eq(c, call)) {
                d.remove(pos);
                found = true;
            }
        });
        found
    }

    /// Pops one ready answer, non-blockingly. Used by the asynchronous-call reaping path.
    pub fn try_reap_answer(&self) -> Option<Arc<Call>> {
        let mut popped = None;
        Self::with(&self.answers, |q| popped = q.pop_front());
        popped
    }

    /// Every call still sitting in `calls` or `dispatched` whose `origin_phone` is `phone`
    /// (compared by pointer identity), removed from its current queue. Used by `Phone::hangup` to
    /// auto-answer everything still in flight on the phone being closed.
    pub(crate) fn drain_calls_from(&self, phone: &crate::phone::Phone) -> Vec<Arc<Call>> {
        let phone_ptr = phone as *const crate::phone::Phone;
        let mut drained = Vec::new();
        let matches = |c: &Arc<Call>| {
            c.origin_phone.as_ref().map_or(false, |p| Arc::as_ptr(p) == phone_ptr)
        };
        Self::with(&self.calls, |q| {
            let mut i = 0;
            while i < q.len() {
                if matches(&q[i]) {
                    drained.push(q.remove(i).unwrap());
                } else {
                    i += 1;
                }
            }
        });
        Self::with(&self.dispatched, |d| {
            let mut i = 0;
            while i < d.len() {
                if matches(&d[i]) {
                    drained.push(d.remove(i));
                } else {
                    i += 1;
                }
            }
        });
        drained
    }

    /// Every call still sitting anywhere in this answerbox -- queued, dispatched to a handler that
    /// hasn't answered yet, or answered but not yet reaped -- removed and returned. Used by
    /// `kernel-task` when a task exits, so `discard_outstanding` can mark each one before the
    /// answerbox itself is dropped.
    pub fn drain_outstanding(&self) -> Vec<Arc<Call>> {
        let mut drained = Vec::new();
        Self::with(&self.calls, |q| drained.extend(q.drain(..)));
        Self::with(&self.dispatched, |d| drained.extend(d.drain(..)));
        Self::with(&self.answers, |q| drained.extend(q.drain(..)));
        Self::with(&self.notifications, |q| drained.extend(q.drain(..)));
        drained
    }
}
