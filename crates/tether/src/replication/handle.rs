use super::ReplicationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle {
    pub id: u16,
    pub generation: u8,
}

impl EntityHandle {
    pub const fn new(id: u16, generation: u8) -> Self {
        Self { id, generation }
    }
}

impl std::fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.id, self.generation)
    }
}

/// True when generation `a` was issued after `b`, with wrap-around.
#[inline]
pub fn generation_newer(a: u8, b: u8) -> bool {
    a != b && a.wrapping_sub(b) < 128
}

#[derive(Debug)]
struct Slot<T> {
    generation: u8,
    value: Option<T>,
}

/// Fixed-capacity storage addressed by generational handles.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    capacity: usize,
    len: usize,
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize + 1);
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            capacity,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Result<EntityHandle, ReplicationError> {
        let id = match self.free.pop() {
            Some(id) => id,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u16
            }
            None => return Err(ReplicationError::CapacityReached(self.capacity)),
        };

        let slot = &mut self.slots[id as usize];
        slot.value = Some(value);
        self.len += 1;

        Ok(EntityHandle::new(id, slot.generation))
    }

    /// Frees the slot and bumps its generation so the handle goes stale.
    pub fn remove(&mut self, handle: EntityHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.id);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&T> {
        self.slots
            .get(handle.id as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: EntityHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.id as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: EntityHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Handle of whatever currently lives in slot `id`.
    pub fn handle_at(&self, id: u16) -> Option<EntityHandle> {
        self.slots
            .get(id as usize)
            .filter(|slot| slot.value.is_some())
            .map(|slot| EntityHandle::new(id, slot.generation))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            slot.value
                .as_ref()
                .map(|value| (EntityHandle::new(id as u16, slot.generation), value))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(id, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|value| (EntityHandle::new(id as u16, generation), value))
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_rejected_after_reuse() {
        let mut table = SlotTable::new(4);
        let old = table.insert("a").unwrap();
        assert_eq!(table.remove(old), Some("a"));

        let new = table.insert("b").unwrap();
        assert_eq!(new.id, old.id);
        assert_eq!(new.generation, old.generation.wrapping_add(1));

        assert_eq!(table.get(old), None);
        assert_eq!(table.get_mut(old), None);
        assert_eq!(table.remove(old), None);
        assert_eq!(table.get(new), Some(&"b"));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut table = SlotTable::new(2);
        table.insert(1).unwrap();
        table.insert(2).unwrap();
        assert_eq!(table.insert(3), Err(ReplicationError::CapacityReached(2)));
    }

    #[test]
    fn generation_wraps() {
        let mut table = SlotTable::new(1);
        let mut handle = table.insert(0).unwrap();
        for _ in 0..256 {
            table.remove(handle);
            handle = table.insert(0).unwrap();
        }
        assert_eq!(handle.generation, 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn generation_ordering_wraps() {
        assert!(generation_newer(1, 0));
        assert!(generation_newer(0, 255));
        assert!(!generation_newer(255, 0));
        assert!(!generation_newer(7, 7));
    }

    #[test]
    fn iteration_skips_free_slots() {
        let mut table = SlotTable::new(4);
        let a = table.insert('a').unwrap();
        let _b = table.insert('b').unwrap();
        table.remove(a);

        let live: Vec<_> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec!['b']);
        assert_eq!(table.handle_at(a.id), None);
    }
}
