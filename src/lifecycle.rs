// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialized access to the shared [`ModelRuntime`] with guaranteed cleanup.
//!
//! [`RuntimeGate`] is the only way to reach a runtime. Acquiring it yields
//! a [`RuntimeSession`], which derefs to the runtime and, when dropped:
//!
//! 1. removes every non-permanent hook and drops the captures the
//!    session produced,
//! 2. if the cache is to be cleared, reclaims device memory,
//! 3. releases the lock.
//!
//! Drop runs on success, on error, and while unwinding from a panic, so the
//! next session always starts from the same baseline.
//!
//! [`RuntimeGate::run`] executes a request body on the blocking pool while
//! holding a session. Dropping the caller's future after the gate was
//! acquired does not interrupt the body; the session still finishes and
//! cleans up on the worker thread.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Result, SaeError};
use crate::runtime::{ModelRuntime, RuntimeProbe};

// ---------------------------------------------------------------------------
// CleanupPolicy
// ---------------------------------------------------------------------------

/// Process-wide cleanup settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPolicy {
    /// Reclaim device memory after every session, whatever the request
    /// asked for.
    pub auto_clear_cache: bool,
}

impl CleanupPolicy {
    /// Policy with the given auto-clear setting.
    #[must_use]
    pub const fn new(auto_clear_cache: bool) -> Self {
        Self { auto_clear_cache }
    }

    /// Whether a session opened with `requested` reclaims device memory on
    /// exit.
    #[must_use]
    pub const fn clears_cache(&self, requested: bool) -> bool {
        requested || self.auto_clear_cache
    }
}

// ---------------------------------------------------------------------------
// RuntimeGate
// ---------------------------------------------------------------------------

/// Mutual-exclusion gate around one [`ModelRuntime`].
///
/// Waiters are woken in FIFO order, so every request eventually runs.
/// There is no acquisition timeout.
#[derive(Debug, Clone)]
pub struct RuntimeGate {
    runtime: Arc<Mutex<ModelRuntime>>,
    policy: CleanupPolicy,
}

impl RuntimeGate {
    /// Take ownership of a runtime.
    #[must_use]
    pub fn new(runtime: ModelRuntime, policy: CleanupPolicy) -> Self {
        Self {
            runtime: Arc::new(Mutex::new(runtime)),
            policy,
        }
    }

    /// Cleanup policy applied to every session.
    #[must_use]
    pub const fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    /// Wait for exclusive access.
    pub async fn acquire(&self, clear_cache: bool) -> RuntimeSession {
        let guard = Arc::clone(&self.runtime).lock_owned().await;
        RuntimeSession::new(guard, self.policy.clears_cache(clear_cache))
    }

    /// Block the current thread until exclusive access is granted.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn acquire_blocking(&self, clear_cache: bool) -> RuntimeSession {
        let guard = Arc::clone(&self.runtime).blocking_lock_owned();
        RuntimeSession::new(guard, self.policy.clears_cache(clear_cache))
    }

    /// Run `body` with exclusive access on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Propagates errors from `body`; returns [`SaeError::Runtime`] if the
    /// body panicked or its task was cancelled.
    pub async fn run<T, F>(&self, clear_cache: bool, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ModelRuntime) -> Result<T> + Send + 'static,
    {
        let mut session = self.acquire(clear_cache).await;
        tokio::task::spawn_blocking(move || body(&mut *session))
            .await
            .map_err(|e| SaeError::Runtime(format!("request task failed: {e}")))?
    }

    /// Run `body` with exclusive access on the current thread.
    ///
    /// # Errors
    ///
    /// Propagates errors from `body`.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn run_blocking<T>(
        &self,
        clear_cache: bool,
        body: impl FnOnce(&mut ModelRuntime) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.acquire_blocking(clear_cache);
        body(&mut *session)
    }

    /// Snapshot of the runtime state, taken under the gate.
    pub async fn probe(&self) -> RuntimeProbe {
        self.runtime.lock().await.probe()
    }
}

// ---------------------------------------------------------------------------
// RuntimeSession
// ---------------------------------------------------------------------------

/// Exclusive access to the runtime; cleans up when dropped.
pub struct RuntimeSession {
    guard: OwnedMutexGuard<ModelRuntime>,
    clear_cache: bool,
}

impl RuntimeSession {
    fn new(guard: OwnedMutexGuard<ModelRuntime>, clear_cache: bool) -> Self {
        tracing::trace!(clear_cache, "runtime session opened");
        Self { guard, clear_cache }
    }

    /// Whether this session reclaims device memory on exit.
    #[must_use]
    pub const fn clears_cache(&self) -> bool {
        self.clear_cache
    }
}

impl Deref for RuntimeSession {
    type Target = ModelRuntime;

    fn deref(&self) -> &ModelRuntime {
        &self.guard
    }
}

impl DerefMut for RuntimeSession {
    fn deref_mut(&mut self) -> &mut ModelRuntime {
        &mut self.guard
    }
}

impl Drop for RuntimeSession {
    fn drop(&mut self) {
        // The guard field is released after this body returns.
        let runtime: &mut ModelRuntime = &mut self.guard;
        let released = runtime.probe().retained_contexts;
        runtime.reset_hooks(true, false);
        if self.clear_cache {
            if let Err(e) = runtime.reclaim_device_memory() {
                tracing::warn!(error = %e, "device memory reclamation failed");
            }
            tracing::info!(released, "cleared runtime cache");
        } else {
            tracing::trace!(released, "runtime session closed");
        }
    }
}

impl std::fmt::Debug for RuntimeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeSession")
            .field("clear_cache", &self.clear_cache)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
