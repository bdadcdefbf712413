// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! Transport tasks run on arbitrary runtime threads. A panic inside one of
//! them must not take the job table down with it, so a poisoned lock is
//! logged and its guard recovered.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "tapedeck::sync",
                event = "LOCK_POISONED",
                "Mutex was poisoned; a thread panicked while holding it. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}
