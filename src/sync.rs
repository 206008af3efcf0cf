// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that survive poisoning.
//!
//! A supervisor task that panics while holding the job table must not take
//! the whole service down with it. These helpers log the poisoning and hand
//! back the guard so request handlers and the dispatcher keep running.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use steamfetch::sync::{resilient_read, resilient_write};
//!
//! let table = RwLock::new(Vec::<u32>::new());
//! resilient_write(&table).push(7);
//! assert_eq!(resilient_read(&table).len(), 1);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "steamfetch::locks",
            event = "LOCK_POISONED_READ",
            "RwLock poisoned during read; recovering. A task panicked while holding it."
        );
        poisoned.into_inner()
    })
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "steamfetch::locks",
            event = "LOCK_POISONED_WRITE",
            "RwLock poisoned during write; recovering. A task panicked while holding it."
        );
        poisoned.into_inner()
    })
}

/// Lock a mutex, recovering from poisoning.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "steamfetch::locks",
            event = "LOCK_POISONED_MUTEX",
            "Mutex poisoned; recovering. A task panicked while holding it."
        );
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_recovers_after_panic() {
        let lock = Arc::new(RwLock::new(1));
        let poisoner = Arc::clone(&lock);

        let _ = thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        *resilient_write(&lock) = 2;
        assert_eq!(*resilient_read(&lock), 2);
    }

    #[test]
    fn test_mutex_recovers_after_panic() {
        let lock = Arc::new(Mutex::new(String::from("a")));
        let poisoner = Arc::clone(&lock);

        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the mutex");
        })
        .join();

        resilient_lock(&lock).push('b');
        assert_eq!(resilient_lock(&lock).as_str(), "ab");
    }
}
