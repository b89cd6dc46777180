// Part of ethercat-rs. Copyright 2018-2022 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The master's serialization guard.
//!
//! Waiting for the guard can be interrupted through a [`Signal`], in which
//! case the waiter gives up with [`Error::Interrupted`] and may retry.

use crate::types::{Error, Result};
use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

/// How often a waiter looks at its signal.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A pending-signal flag shared between a waiter and whoever interrupts it.
#[derive(Debug, Clone, Default)]
pub struct Signal(Arc<AtomicBool>);

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consumes a pending signal.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Ownership flag of the guard, waited on by contenders.
#[derive(Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

impl Slot {
    fn acquire(&self, signal: Option<&Signal>) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            if signal.map_or(false, Signal::take) {
                return Err(Error::Interrupted);
            }
            held = self
                .released
                .wait_timeout(held, SIGNAL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *held = true;
        // a signal meant for this wait must not hit the next one
        if let Some(signal) = signal {
            signal.take();
        }
        Ok(())
    }

    fn try_acquire(&self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if *held {
            return false;
        }
        *held = true;
        true
    }
}

/// Releases the slot once the data lock is gone.
struct Release<'a>(&'a Slot);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut held = self.0.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.0.released.notify_one();
    }
}

/// A mutex whose waiters can be interrupted.
///
/// The data sits behind a plain [`Mutex`] that is only ever locked by the
/// owner of the slot, so it never blocks; contention is handled on the slot.
#[derive(Default)]
pub struct InterruptibleMutex<T> {
    slot: Slot,
    data: Mutex<T>,
}

impl<T> InterruptibleMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            slot: Slot::default(),
            data: Mutex::new(data),
        }
    }

    fn guard(&self) -> Guard<'_, T> {
        Guard {
            data: self.data.lock().unwrap_or_else(PoisonError::into_inner),
            _release: Release(&self.slot),
        }
    }

    /// Waits for the guard without giving up.
    pub fn lock(&self) -> Guard<'_, T> {
        let _ = self.slot.acquire(None);
        self.guard()
    }

    /// Waits for the guard until it is free or `signal` is raised.
    ///
    /// A signal raised before the guard is obtained is consumed either way.
    pub fn lock_interruptible(&self, signal: &Signal) -> Result<Guard<'_, T>> {
        self.slot.acquire(Some(signal))?;
        Ok(self.guard())
    }

    pub fn try_lock(&self) -> Option<Guard<'_, T>> {
        if self.slot.try_acquire() {
            Some(self.guard())
        } else {
            None
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive access to the data of an [`InterruptibleMutex`].
///
/// Like [`MutexGuard`], a guard is only shared between threads if `T` is:
///
/// ```compile_fail
/// fn shared<T: Sync>() {}
/// shared::<ethercat_core::Guard<'static, std::cell::Cell<u32>>>();
/// ```
pub struct Guard<'a, T> {
    // dropped before the slot is released
    data: MutexGuard<'a, T>,
    _release: Release<'a>,
}

impl<T> Deref for Guard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for Guard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[test]
fn test_interrupted_wait() {
    let lock = InterruptibleMutex::new(1);
    let signal = Signal::new();
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());

    signal.raise();
    assert!(matches!(
        lock.lock_interruptible(&signal),
        Err(Error::Interrupted)
    ));
    assert!(!signal.is_pending());
    drop(guard);

    let mut guard = lock.lock_interruptible(&signal).unwrap();
    *guard += 1;
    drop(guard);
    assert_eq!(lock.into_inner(), 2);
}

#[test]
fn test_signal_from_other_thread() {
    use std::{sync::mpsc, thread};

    let lock = Arc::new(InterruptibleMutex::new(()));
    let signal = Signal::new();
    let guard = lock.lock();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let lock = lock.clone();
        let signal = signal.clone();
        thread::spawn(move || {
            tx.send(()).unwrap();
            lock.lock_interruptible(&signal).map(|_| ()).unwrap_err()
        })
    };
    rx.recv().unwrap();
    thread::sleep(Duration::from_millis(5));
    signal.raise();
    assert!(matches!(waiter.join().unwrap(), Error::Interrupted));
    drop(guard);
}

#[test]
fn test_stale_signal_is_consumed() {
    let lock = InterruptibleMutex::new(());
    let signal = Signal::new();
    signal.raise();
    assert!(lock.lock_interruptible(&signal).is_ok());
    assert!(!signal.is_pending());

    // a later wait is not cut short by the old signal
    let guard = lock.lock();
    assert!(lock.try_lock().is_none());
    drop(guard);
    assert!(lock.lock_interruptible(&signal).is_ok());
}

#[test]
fn test_guards_serialize_threads() {
    use std::thread;

    let lock = InterruptibleMutex::new(0u32);
    let signal = Signal::new();
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    let mut guard = lock.lock_interruptible(&signal).unwrap();
                    let value = *guard;
                    thread::yield_now();
                    *guard = value + 1;
                }
            });
        }
    });
    assert_eq!(lock.into_inner(), 400);
}

#[test]
fn test_poisoned_guard_is_recovered() {
    use std::{panic, thread};

    let lock = Arc::new(InterruptibleMutex::new(5));
    let poisoner = lock.clone();
    let result = thread::spawn(move || {
        let _guard = poisoner.lock();
        panic::panic_any("cyclic task died");
    })
    .join();
    assert!(result.is_err());
    assert_eq!(*lock.try_lock().unwrap(), 5);
}
