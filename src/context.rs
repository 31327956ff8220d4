// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Cooperative cancellation signals.
//!
//! A [Context] is a shareable cancellation flag with hooks.  Relays
//! register a hook that closes their streams, so that cancelling a
//! context unblocks any reads or writes in progress.  Contexts form a
//! tree: cancelling a context cancels all of its children, but not
//! its parent.
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use log::error;
use log::trace;

type Hook = Box<dyn FnOnce() + Send>;

struct ContextState {
    cancelled: bool,
    next_id: usize,
    hooks: Vec<(usize, Hook)>
}

struct ContextInner {
    state: Mutex<ContextState>
}

/// A cancellation signal.
///
/// Cloning a `Context` produces another handle to the same signal.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>
}

/// Registration of a cancellation hook.
///
/// Dropping this deregisters the hook, if it has not already run.
pub struct CancelGuard {
    ctx: Weak<ContextInner>,
    id: usize
}

impl ContextInner {
    fn new() -> Self {
        ContextInner {
            state: Mutex::new(ContextState {
                cancelled: false,
                next_id: 0,
                hooks: Vec::new()
            })
        }
    }

    fn cancel(&self) {
        let hooks = match self.state.lock() {
            Ok(mut guard) => {
                if guard.cancelled {
                    return;
                }

                guard.cancelled = true;

                std::mem::take(&mut guard.hooks)
            }
            Err(_) => {
                error!(target: "context",
                       "mutex poisoned");

                return;
            }
        };

        trace!(target: "context",
               "running {} cancellation hooks",
               hooks.len());

        // Hooks run outside the lock, as they may touch other contexts.
        for (_, hook) in hooks {
            hook()
        }
    }

    fn is_cancelled(&self) -> bool {
        match self.state.lock() {
            Ok(guard) => guard.cancelled,
            Err(_) => true
        }
    }

    // Returns None if the hook ran immediately.
    fn register(
        &self,
        hook: Hook
    ) -> Option<usize> {
        match self.state.lock() {
            Ok(mut guard) => {
                if !guard.cancelled {
                    let id = guard.next_id;

                    guard.next_id += 1;
                    guard.hooks.push((id, hook));

                    return Some(id);
                }
            }
            Err(_) => {
                error!(target: "context",
                       "mutex poisoned");
            }
        }

        hook();

        None
    }

    fn deregister(
        &self,
        id: usize
    ) {
        if let Ok(mut guard) = self.state.lock() {
            guard.hooks.retain(|(hook_id, _)| *hook_id != id)
        }
    }
}

impl Context {
    /// Create a new, uncancelled root `Context`.
    #[inline]
    pub fn new() -> Self {
        Context {
            inner: Arc::new(ContextInner::new())
        }
    }

    /// Cancel this context and all of its children.
    ///
    /// This runs every registered hook exactly once.  Cancelling an
    /// already-cancelled context does nothing.
    #[inline]
    pub fn cancel(&self) {
        self.inner.cancel()
    }

    /// Check whether this context has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Register a hook to run when this context is cancelled.
    ///
    /// If the context is already cancelled, the hook runs
    /// immediately.  The hook is deregistered when the returned guard
    /// is dropped.
    pub fn on_cancel<F>(
        &self,
        hook: F
    ) -> CancelGuard
    where
        F: 'static + FnOnce() + Send {
        match self.inner.register(Box::new(hook)) {
            Some(id) => CancelGuard {
                ctx: Arc::downgrade(&self.inner),
                id: id
            },
            None => CancelGuard {
                ctx: Weak::new(),
                id: 0
            }
        }
    }

    /// Create a child context.
    ///
    /// The child is cancelled when this context is cancelled, but
    /// can also be cancelled on its own.  The link to the parent is
    /// released when the child is dropped.
    pub fn child(&self) -> ChildContext {
        let child = Context::new();
        let weak = Arc::downgrade(&child.inner);
        let guard = self.on_cancel(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel()
            }
        });

        ChildContext {
            ctx: child,
            _parent: guard
        }
    }
}

/// A [Context] linked to a parent.
///
/// This dereferences to the child [Context].
pub struct ChildContext {
    ctx: Context,
    _parent: CancelGuard
}

impl std::ops::Deref for ChildContext {
    type Target = Context;

    #[inline]
    fn deref(&self) -> &Context {
        &self.ctx
    }
}

impl Default for Context {
    #[inline]
    fn default() -> Self {
        Context::new()
    }
}

impl Debug for Context {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Debug for ChildContext {
    #[inline]
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        self.ctx.fmt(f)
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.ctx.upgrade() {
            inner.deregister(self.id)
        }
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::atomic::Ordering;

#[test]
fn test_cancel_runs_hooks_once() {
    crate::init();

    let ctx = Context::new();
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = count.clone();
    let _guard = ctx.on_cancel(move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
    });

    assert!(!ctx.is_cancelled());

    ctx.cancel();
    ctx.cancel();

    assert!(ctx.is_cancelled());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hook_after_cancel_runs_immediately() {
    crate::init();

    let ctx = Context::new();
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = count.clone();

    ctx.cancel();

    let _guard = ctx.on_cancel(move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropped_guard_deregisters() {
    crate::init();

    let ctx = Context::new();
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = count.clone();
    let guard = ctx.on_cancel(move || {
        hook_count.fetch_add(1, Ordering::SeqCst);
    });

    drop(guard);
    ctx.cancel();

    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_child_cancelled_by_parent() {
    crate::init();

    let parent = Context::new();
    let child = parent.child();
    let grandchild = child.child();

    assert!(!grandchild.is_cancelled());

    parent.cancel();

    assert!(child.is_cancelled());
    assert!(grandchild.is_cancelled());
}

#[test]
fn test_child_cancel_leaves_parent() {
    crate::init();

    let parent = Context::new();
    let child = parent.child();

    child.cancel();

    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());
}
