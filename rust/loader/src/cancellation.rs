// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a shared flag plus an ordered list of cleanup
//! callbacks. Running work polls [`CancellationToken::is_cancelled`] at safe
//! points; nothing is interrupted preemptively.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Handle returned by [`CancellationToken::register_cleanup_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    next_id: u64,
    callbacks: Vec<(CallbackId, CleanupFn)>,
}

/// Shared, clonable cancel flag with cleanup callbacks.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<TokenState>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel. Only the first call has any effect.
    ///
    /// Callbacks run in registration order after the lock is released, so a
    /// callback may freely use this token again.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };

        tracing::debug!(callbacks = callbacks.len(), "Cancellation requested");
        for (id, callback) in callbacks {
            run_callback(id, callback);
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Register a cleanup callback.
    ///
    /// If the token is already cancelled the callback runs immediately on the
    /// calling thread.
    pub fn register_cleanup_callback<F>(&self, callback: F) -> CallbackId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = {
            let mut state = self.lock();
            let id = CallbackId(state.next_id);
            state.next_id += 1;
            if !state.cancelled {
                state.callbacks.push((id, Box::new(callback)));
                return id;
            }
            id
        };
        run_callback(id, Box::new(callback));
        id
    }

    /// Remove a pending callback. Returns `false` if it was not registered
    /// (or has already run).
    pub fn unregister_cleanup_callback(&self, id: CallbackId) -> bool {
        let mut state = self.lock();
        match state.callbacks.iter().position(|(cb_id, _)| *cb_id == id) {
            Some(pos) => {
                state.callbacks.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of callbacks still waiting for `cancel()`.
    pub fn pending_callbacks(&self) -> usize {
        self.lock().callbacks.len()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

fn run_callback(id: CallbackId, callback: CleanupFn) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        tracing::warn!(
            callback = id.0,
            panic = %panic_message(panic.as_ref()),
            "Cleanup callback panicked"
        );
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        token.register_cleanup_callback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let token = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            token.register_cleanup_callback(move || order.lock().unwrap().push(i));
        }
        token.cancel();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        token.register_cleanup_callback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        token.cancel();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_before_cancel_waits() {
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        token.register_cleanup_callback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(token.pending_callbacks(), 1);

        token.cancel();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(token.pending_callbacks(), 0);
    }

    #[test]
    fn test_unregister() {
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let id = token.register_cleanup_callback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(token.unregister_cleanup_callback(id));
        assert!(!token.unregister_cleanup_callback(id));
        token.cancel();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicUsize::new(0));

        token.register_cleanup_callback(|| panic!("cleanup exploded"));
        let r = ran.clone();
        token.register_cleanup_callback(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_callback_does_not_deadlock() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        token.register_cleanup_callback(move || {
            if inner.is_cancelled() {
                s.fetch_add(1, Ordering::SeqCst);
            }
            inner.cancel();
        });
        token.cancel();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
