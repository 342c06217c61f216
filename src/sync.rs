use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StorageError};

/// A value that can only be touched while holding its mutex.
///
/// Every access goes through [`Synchronized::with_lock`], so the lock scope
/// is always the closure body and nothing escapes it.
#[derive(Debug, Default)]
pub struct Synchronized<T> {
    inner: Mutex<T>,
}

impl<T> Synchronized<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let mut guard = self.inner.lock().map_err(StorageError::lock)?;
        Ok(f(&mut guard))
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(StorageError::lock)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(StorageError::lock)
}
