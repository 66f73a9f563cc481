//! A minimal test-and-set spinlock.
//!
//! Central-cache critical sections are a handful of pointer writes, so a
//! full mutex is overkill; a contended spinner yields the scheduler
//! instead of blocking.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use std::thread;

pub struct SpinMutex<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the flag hands out exclusive access to the value.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        SpinMutex {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Spins until the flag is ours. Acquire on success pairs with the
    /// release in the guard's drop.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self.flag.swap(true, Ordering::Acquire) {
            thread::yield_now();
        }
        SpinGuard { lock: self }
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the flag is ours until drop.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the flag is ours until drop.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}
