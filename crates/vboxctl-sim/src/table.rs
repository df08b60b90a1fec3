//! Generational object table.
//!
//! Slots are reused after removal; each reuse bumps the slot generation so
//! that references minted for the previous occupant stop resolving.

use vboxctl_protocol::ObjectRef;

struct Slot<T> {
    generation: u16,
    entry: Option<(u32, T)>,
}

/// Table of server-side objects keyed by [`ObjectRef`].
pub(crate) struct ObjectTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> ObjectTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store `value` on behalf of logon session `owner` and mint a reference.
    pub fn insert(&mut self, owner: u32, value: T) -> ObjectRef {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.entry = Some((owner, value));
            return ObjectRef::new(owner, index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            entry: Some((owner, value)),
        });
        ObjectRef::new(owner, index, 1)
    }

    fn slot(&self, r: ObjectRef) -> Option<&Slot<T>> {
        self.slots
            .get(r.slot() as usize)
            .filter(|s| s.generation == r.generation())
    }

    /// Resolve a reference. Stale, released and foreign references miss.
    pub fn get(&self, r: ObjectRef) -> Option<&T> {
        match &self.slot(r)?.entry {
            Some((owner, value)) if *owner == r.session() => Some(value),
            _ => None,
        }
    }

    /// Resolve a reference mutably.
    pub fn get_mut(&mut self, r: ObjectRef) -> Option<&mut T> {
        let slot = self
            .slots
            .get_mut(r.slot() as usize)
            .filter(|s| s.generation == r.generation())?;
        match &mut slot.entry {
            Some((owner, value)) if *owner == r.session() => Some(value),
            _ => None,
        }
    }

    /// Remove an object, returning it if the reference was live.
    pub fn remove(&mut self, r: ObjectRef) -> Option<T> {
        self.get(r)?;
        let slot = &mut self.slots[r.slot() as usize];
        let (_, value) = slot.entry.take()?;
        self.free.push(r.slot());
        self.live -= 1;
        Some(value)
    }

    /// Remove every object owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: u32) -> usize {
        let mut removed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(&slot.entry, Some((o, _)) if *o == owner) {
                slot.entry = None;
                self.free.push(index as u32);
                removed += 1;
            }
        }
        self.live -= removed;
        removed
    }

    /// Iterate live objects mutably with their references.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectRef, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry
                .as_mut()
                .map(|(owner, value)| (ObjectRef::new(*owner, index as u32, generation), value))
        })
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }
}
