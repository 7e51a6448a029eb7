//! Generation-checked arena handles
//!
//! Every engine resource lives in an [`Arena`] slot. A [`Handle`] carries the
//! slot index and the generation the slot had when the resource was
//! inserted; removing the resource bumps the generation, so an old handle
//! can never reach whatever reuses the slot.
//!
//! Handles cross the C ABI as a non-zero `u64`: the arena's type tag in the
//! top byte, a 24-bit generation below it and `index + 1` in the low 32 bits.
//! An arena rejects any handle whose tag is not its own.

use std::fmt;
use std::marker::PhantomData;

use crate::error::{Result, VbarError};

/// Largest generation that fits the ABI encoding
const GENERATION_MASK: u32 = 0x00FF_FFFF;

/// Type tags, one per arena
pub(crate) const VBAR_TAG: u8 = 1;
pub(crate) const SLOT_TAG: u8 = 2;
pub(crate) const HOST_BUFFER_TAG: u8 = 3;
pub(crate) const VRAM_BUFFER_TAG: u8 = 4;

/// Typed handle into an [`Arena`]
pub struct Handle<T> {
    tag: u8,
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(tag: u8, index: u32, generation: u32) -> Self {
        Self {
            tag,
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// ABI encoding, never zero
    #[must_use]
    pub fn to_raw(self) -> u64 {
        (u64::from(self.tag) << 56)
            | (u64::from(self.generation & GENERATION_MASK) << 32)
            | (u64::from(self.index) + 1)
    }

    /// Decode an ABI value; `None` for zero
    ///
    /// The type tag is only checked when the handle reaches an arena.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let low = (raw & 0xFFFF_FFFF) as u32;
        if low == 0 {
            return None;
        }
        let generation = ((raw >> 32) as u32) & GENERATION_MASK;
        Some(Self::new((raw >> 56) as u8, low - 1, generation))
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
        self.tag == other.tag && self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.tag, self.index, self.generation).cmp(&(other.tag, other.index, other.generation))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}:{}v{})", self.tag, self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Owning table of resources addressed by [`Handle`]
pub(crate) struct Arena<T> {
    kind: &'static str,
    tag: u8,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new(kind: &'static str, tag: u8) -> Self {
        Self {
            kind,
            tag,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(self.tag, index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        Handle::new(self.tag, index, 1)
    }

    fn check_tag(&self, handle: Handle<T>) -> Result<()> {
        if handle.tag == self.tag {
            Ok(())
        } else {
            Err(VbarError::InvalidHandle(self.kind))
        }
    }

    pub(crate) fn get(&self, handle: Handle<T>) -> Result<&T> {
        self.check_tag(handle)?;
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(VbarError::StaleHandle(self.kind))
    }

    pub(crate) fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        self.check_tag(handle)?;
        let kind = self.kind;
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(VbarError::StaleHandle(kind))
    }

    pub(crate) fn remove(&mut self, handle: Handle<T>) -> Result<T> {
        self.check_tag(handle)?;
        let kind = self.kind;
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
            .ok_or(VbarError::StaleHandle(kind))?;
        let value = slot.value.take().ok_or(VbarError::StaleHandle(kind))?;
        slot.generation = (slot.generation.wrapping_add(1) & GENERATION_MASK).max(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(self.tag, i as u32, slot.generation), v))
        })
    }

    pub(crate) fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        let handles = self.handles();
        handles
            .into_iter()
            .filter_map(|h| self.remove(h).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get() {
        let mut arena = Arena::new("thing", 9);
        let a = arena.insert(10);
        let b = arena.insert(20);
        assert_eq!(*arena.get(a).unwrap(), 10);
        assert_eq!(*arena.get(b).unwrap(), 20);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_after_remove() {
        let mut arena = Arena::new("thing", 9);
        let a = arena.insert(1);
        assert_eq!(arena.remove(a).unwrap(), 1);
        assert_eq!(arena.get(a), Err(VbarError::StaleHandle("thing")));
        assert_eq!(arena.remove(a), Err(VbarError::StaleHandle("thing")));
    }

    #[test]
    fn test_slot_reuse_does_not_alias() {
        let mut arena = Arena::new("thing", 9);
        let a = arena.insert(1);
        arena.remove(a).unwrap();
        let b = arena.insert(2);
        assert_ne!(a, b);
        assert_ne!(a.to_raw(), b.to_raw());
        assert!(arena.get(a).is_err());
        assert_eq!(*arena.get(b).unwrap(), 2);
    }

    #[test]
    fn test_raw_roundtrip_nonzero() {
        let mut arena = Arena::new("thing", 9);
        let a = arena.insert(());
        let raw = a.to_raw();
        assert_ne!(raw, 0);
        assert_eq!(Handle::<()>::from_raw(raw), Some(a));
        assert_eq!(Handle::<()>::from_raw(0), None);
    }

    #[test]
    fn test_forged_handle_rejected() {
        let mut arena: Arena<u8> = Arena::new("thing", 9);
        arena.insert(1);
        let forged = Handle::<u8>::from_raw((9u64 << 56) | (7u64 << 32) | 1).unwrap();
        assert_eq!(arena.get(forged), Err(VbarError::StaleHandle("thing")));
        let out_of_range = Handle::<u8>::from_raw((9u64 << 56) | 99).unwrap();
        assert!(arena.get(out_of_range).is_err());
    }

    #[test]
    fn test_foreign_tag_rejected() {
        let mut things: Arena<u8> = Arena::new("thing", 9);
        let mut others: Arena<u8> = Arena::new("other", 5);
        let thing = things.insert(1);
        let other = others.insert(2);
        assert_eq!(thing.to_raw() & 0xFFFF_FFFF, other.to_raw() & 0xFFFF_FFFF);

        let crossed = Handle::<u8>::from_raw(other.to_raw()).unwrap();
        assert_eq!(things.get(crossed), Err(VbarError::InvalidHandle("thing")));
        assert_eq!(things.remove(crossed), Err(VbarError::InvalidHandle("thing")));
        let untagged = Handle::<u8>::from_raw(thing.to_raw() & !(0xFFu64 << 56)).unwrap();
        assert!(things.get_mut(untagged).is_err());
        assert_eq!(*things.get(thing).unwrap(), 1);
    }

    #[test]
    fn test_generation_wraps_inside_encoding() {
        let mut arena = Arena::new("thing", 9);
        arena.insert(0);
        arena.slots[0].generation = GENERATION_MASK;
        let last = Handle::<i32>::new(9, 0, GENERATION_MASK);
        assert_eq!(Handle::<i32>::from_raw(last.to_raw()), Some(last));
        arena.remove(last).unwrap();
        let reused = arena.insert(1);
        assert_eq!(reused.generation, 1);
        assert_eq!(reused.to_raw() >> 56, 9);
        assert!(arena.get(last).is_err());
    }

    #[test]
    fn test_iter_and_drain() {
        let mut arena = Arena::new("thing", 9);
        let a = arena.insert(1);
        arena.insert(2);
        arena.insert(3);
        arena.remove(a).unwrap();
        let mut seen: Vec<i32> = arena.iter().map(|(_, v)| *v).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3]);
        assert_eq!(arena.drain().len(), 2);
        assert_eq!(arena.len(), 0);
    }
}
