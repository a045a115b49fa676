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

//! A unidirectional send endpoint, published into a task's capability table, naming the
//! answerbox it delivers calls to.

use {
    alloc::sync::Arc,
    core::sync::atomic::{AtomicBool, AtomicUsize, Ordering},

    cap::{KObject, KObjectKind},
    error::KernelError,
    i18n::Text,
    locks::Mutex,
    waitq::WakeMode,

    crate::{IPC_MAX_ASYNC_CALLS, answerbox::Answerbox, call::Call}
};

/// A phone: a handle a task holds that lets it place calls against some answerbox, until the
/// phone is hung up (explicitly, or because the answerbox side is gone).
pub struct Phone {
    target: Mutex<Option<Arc<Answerbox>>>,
    hung_up: AtomicBool,
    /// In-flight asynchronous calls placed through this phone and not yet reaped. Synchronous
    /// calls don't count against this: the caller's own blocked thread is the natural limit there.
    async_in_flight: AtomicUsize
}

impl Phone {
    /// Creates a new phone connected to `target`.
    pub fn new(target: Arc<Answerbox>) -> Arc<Phone> {
        Arc::new(Phone {
            target: Mutex::new(Some(target)),
            hung_up: AtomicBool::new(false),
            async_in_flight: AtomicUsize::new(0)
        })
    }

    fn with_target<R>(&self, f: impl FnOnce(&Option<Arc<Answerbox>>) -> R) -> R {
        loop {
            if let Ok(target) = self.target.try_lock() {
                return f(&target);
            }
        }
    }

    /// The answerbox this phone currently delivers to, or `None` once hung up.
    pub fn target(&self) -> Option<Arc<Answerbox>> {
        self.with_target(|t| t.clone())
    }

    /// True once `hangup` has run (or this phone's capability was revoked).
    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::Acquire)
    }

    /// Reserves one of this phone's `IPC_MAX_ASYNC_CALLS` async-call slots, failing with
    /// `KernelError::Limit` if the phone is already at its cap.
    pub(crate) fn reserve_async_slot(&self) -> Result<(), KernelError> {
        loop {
            let current = self.async_in_flight.load(Ordering::Acquire);
            if current >= IPC_MAX_ASYNC_CALLS {
                let _ = Text::IpcAsyncCallsExhausted;
                return Err(KernelError::Limit);
            }
            if self.async_in_flight.compare_exchange(
                current, current + 1, Ordering::AcqRel, Ordering::Acquire
            ).is_ok() {
                return Ok(());
            }
        }
    }

    /// Releases a slot reserved by `reserve_async_slot`, once the call's answer has been reaped.
    pub(crate) fn release_async_slot(&self) {
        self.async_in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Closes the phone. Any call still sitting in the target answerbox's `calls` or `dispatched`
    /// queue that originated from this phone is auto-answered with `KernelError::Hangup`, and its
    /// sender is woken.
    pub fn hangup(&self) {
        if self.hung_up.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = self.with_target(|t| t.clone());
        self.with_target_mut(|t| *t = None);

        if let Some(target) = target {
            let stranded = target.drain_calls_from(self);
            for call in stranded {
                let words = call.words();
                call.complete(words, Some(KernelError::Hangup));
                if !call.flags().contains(crate::call::CallFlags::DISCARD_ANSWER) {
                    if let Some(reply_answerbox) = &call.reply_answerbox {
                        reply_answerbox.push_answer(Arc::clone(&call));
                    }
                }
                call.sender_waitq.wakeup(WakeMode::First);
            }
        }
    }

    fn with_target_mut(&self, f: impl FnOnce(&mut Option<Arc<Answerbox>>)) {
        loop {
            if let Ok(mut target) = self.target.try_lock() {
                f(&mut target);
                return;
            }
        }
    }
}

impl KObject for Phone {
    fn kind(&self) -> KObjectKind {
        KObjectKind::Phone
    }

    fn on_revoke(&self) {
        self.hangup();
    }
}
