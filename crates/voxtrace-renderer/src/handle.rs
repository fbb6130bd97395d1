//! Generational handle tables.
//!
//! Device resources are stored in an arena and addressed by `(index, generation)`
//! pairs. Releasing a slot bumps its generation, so a handle kept past its
//! resource's lifetime is detected instead of silently aliasing a new resource.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{RtError, RtResult};

/// Typed handle into a [`HandleTable`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of `T` with a free list and per-slot generation counters.
pub struct HandleTable<T> {
    kind: &'static str,
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table. `kind` names the resource in stale-handle errors.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// Remove the value, invalidating every copy of `handle`.
    pub fn remove(&mut self, handle: Handle<T>) -> RtResult<T> {
        let kind = self.kind;
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or_else(|| stale(kind, handle))?;

        let value = slot.value.take().ok_or_else(|| stale(kind, handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.live -= 1;
        Ok(value)
    }

    pub fn get(&self, handle: Handle<T>) -> RtResult<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or_else(|| stale(self.kind, handle))
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> RtResult<&mut T> {
        let kind = self.kind;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or_else(|| stale(kind, handle))
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Remove every live entry, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                out.push(value);
            }
        }
        self.live = 0;
        out
    }
}

fn stale<T>(kind: &'static str, handle: Handle<T>) -> RtError {
    RtError::StaleHandle {
        kind,
        index: handle.index,
        generation: handle.generation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut table = HandleTable::new("buffer");
        let a = table.insert(10u32);
        let b = table.insert(20u32);
        assert_eq!(*table.get(a).unwrap(), 10);
        assert_eq!(*table.get(b).unwrap(), 20);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_removed_handle_is_stale() {
        let mut table = HandleTable::new("image");
        let a = table.insert("a");
        assert_eq!(table.remove(a).unwrap(), "a");
        assert!(!table.contains(a));
        match table.get(a) {
            Err(RtError::StaleHandle { kind, index, generation }) => {
                assert_eq!(kind, "image");
                assert_eq!(index, 0);
                assert_eq!(generation, 0);
            }
            _ => panic!("expected stale handle"),
        }
        assert!(table.remove(a).is_err());
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut table = HandleTable::new("buffer");
        let a = table.insert(1);
        table.remove(a).unwrap();
        let b = table.insert(2);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert_ne!(a, b);
        assert!(table.get(a).is_err());
        assert_eq!(*table.get(b).unwrap(), 2);
    }

    #[test]
    fn test_drain_invalidates_everything() {
        let mut table = HandleTable::new("buffer");
        let handles: Vec<_> = (0..4).map(|i| table.insert(i)).collect();
        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(table.is_empty());
        assert!(handles.iter().all(|h| !table.contains(*h)));
    }
}
