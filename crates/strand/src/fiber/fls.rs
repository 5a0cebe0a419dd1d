//! Fiber-local storage
//!
//! A process-global allocator hands out integer keys; every fiber owns a
//! slot vector indexed by key. [`FiberLocal`] wraps a key with a typed
//! get/set API that operates on the currently executing fiber.
//!
//! Keys are reused after a [`FiberLocal`] is dropped. A slot written under
//! an old key carries that key's generation, so a reused key reads stale
//! slots as empty rather than leaking a previous owner's value.

use super::Fiber;

use parking_lot::Mutex;
use std::any::Any;
use std::marker::PhantomData;

/// One fiber-local slot: the key generation it was written under, plus the
/// boxed value.
pub(crate) struct Slot {
    generation: u64,
    value: Option<Box<dyn Any + Send>>,
}

struct KeyInfo {
    in_use: bool,
    generation: u64,
}

static REGISTRY: Mutex<Vec<KeyInfo>> = Mutex::new(Vec::new());

fn alloc_key() -> (usize, u64) {
    let mut registry = REGISTRY.lock();
    for (key, info) in registry.iter_mut().enumerate() {
        if !info.in_use {
            info.in_use = true;
            return (key, info.generation);
        }
    }
    registry.push(KeyInfo {
        in_use: true,
        generation: 0,
    });
    (registry.len() - 1, 0)
}

fn free_key(key: usize) {
    let mut registry = REGISTRY.lock();
    let info = &mut registry[key];
    assert!(info.in_use, "double free of fiber-local key {}", key);
    info.in_use = false;
    info.generation += 1;
}

/// A typed per-fiber value.
///
/// Each instance allocates a distinct key; every fiber sees its own copy
/// of the value, defaulting to "unset".
pub struct FiberLocal<T> {
    key: usize,
    generation: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> FiberLocal<T> {
    /// Allocate a fresh fiber-local key.
    pub fn new() -> FiberLocal<T> {
        let (key, generation) = alloc_key();
        FiberLocal {
            key,
            generation,
            _marker: PhantomData,
        }
    }

    /// Set the value for the currently executing fiber.
    pub fn set(&self, value: T) {
        let fiber = Fiber::current();
        // SAFETY: slots of the current fiber are only touched from its own
        // thread of execution.
        let slots = unsafe { &mut *fiber.fls_slots() };
        if slots.len() <= self.key {
            slots.resize_with(self.key + 1, || Slot {
                generation: 0,
                value: None,
            });
        }
        slots[self.key] = Slot {
            generation: self.generation,
            value: Some(Box::new(value)),
        };
    }

    /// Remove and return the current fiber's value.
    pub fn take(&self) -> Option<T> {
        let fiber = Fiber::current();
        // SAFETY: as in `set`.
        let slots = unsafe { &mut *fiber.fls_slots() };
        let slot = slots.get_mut(self.key)?;
        if slot.generation != self.generation {
            return None;
        }
        slot.value.take().and_then(|v| v.downcast::<T>().ok()).map(|v| *v)
    }
}

impl<T: Send + Clone + 'static> FiberLocal<T> {
    /// The current fiber's value, if set.
    pub fn get(&self) -> Option<T> {
        let fiber = Fiber::current();
        // SAFETY: as in `set`.
        let slots = unsafe { &*fiber.fls_slots() };
        let slot = slots.get(self.key)?;
        if slot.generation != self.generation {
            return None;
        }
        slot.value.as_ref().and_then(|v| v.downcast_ref::<T>()).cloned()
    }
}

impl<T: Send + 'static> Default for FiberLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FiberLocal<T> {
    fn drop(&mut self) {
        free_key(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;

    #[test]
    fn test_unset_reads_none() {
        let local: FiberLocal<u32> = FiberLocal::new();
        assert_eq!(local.get(), None);
    }

    #[test]
    fn test_set_get_take() {
        let local = FiberLocal::new();
        local.set(7u32);
        assert_eq!(local.get(), Some(7));
        assert_eq!(local.take(), Some(7));
        assert_eq!(local.get(), None);
    }

    #[test]
    fn test_values_are_per_fiber() {
        let local = std::sync::Arc::new(FiberLocal::<u32>::new());
        local.set(1);
        let l = local.clone();
        let fiber = Fiber::new(move || {
            assert_eq!(l.get(), None);
            l.set(2);
            assert_eq!(l.get(), Some(2));
        });
        fiber.call();
        // The other fiber's write did not leak into this one.
        assert_eq!(local.get(), Some(1));
    }

    #[test]
    fn test_reused_key_reads_empty() {
        let first: FiberLocal<u32> = FiberLocal::new();
        let key = first.key;
        first.set(42);
        drop(first);
        // Allocate until the freed key comes around again. The registry is
        // process-global, so a concurrent test may claim it first; in that
        // case there is nothing to observe.
        let mut locals = Vec::new();
        for _ in 0..1024 {
            let local: FiberLocal<u32> = FiberLocal::new();
            if local.key == key {
                // Reused key: the stale slot reads as empty.
                assert_eq!(local.get(), None);
                return;
            }
            locals.push(local);
        }
    }
}
