//! Generation-checked slab used for recycled queue entries.
//!
//! Entries live in a flat `Vec` of slots; vacant slots form a LIFO free list.
//! Growth happens in fixed batches so steady-state traffic never touches the
//! allocator. A [`Handle`] carries the slot's generation at insertion time,
//! and every removal bumps it, so a stale handle can never reach an entry that
//! was recycled for another operation.

/// Opaque reference to an occupied slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index, stable for the lifetime of the entry.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
enum Slot<T> {
    Vacant { generation: u32 },
    Occupied { generation: u32, value: T },
}

/// Batch-growing arena with generation-checked handles.
#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    batch: usize,
    len: usize,
    grown: usize,
}

impl<T> Slab<T> {
    /// Creates a slab that grows `batch` slots at a time.
    pub fn with_batch(batch: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            batch: batch.max(1),
            len: 0,
            grown: 0,
        }
    }

    /// Creates a slab with `capacity` vacant slots already allocated.
    pub fn preallocated(capacity: usize, batch: usize) -> Self {
        let mut slab = Self::with_batch(batch);
        slab.reserve_slots(capacity);
        slab.grown = 0;
        slab
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total slots, occupied or vacant.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Vacant slots ready for reuse.
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Number of growth batches taken after construction.
    pub fn growth_events(&self) -> usize {
        self.grown
    }

    /// Stores `value`, growing by one batch when no vacant slot is left.
    pub fn insert(&mut self, value: T) -> Handle {
        if self.free.is_empty() {
            self.reserve_slots(self.batch);
            self.grown += 1;
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => unreachable!("slab grew without producing a vacant slot"),
        };
        let slot = &mut self.slots[index as usize];
        let generation = match slot {
            Slot::Vacant { generation } => *generation,
            Slot::Occupied { .. } => unreachable!("free list pointed at occupied slot {index}"),
        };
        *slot = Slot::Occupied { generation, value };
        self.len += 1;
        Handle { index, generation }
    }

    /// Removes the entry behind `handle`, returning its slot to the free list.
    ///
    /// Returns `None` when the handle is stale or was already removed.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        let generation = match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => *generation,
            _ => return None,
        };
        let next = Slot::Vacant {
            generation: generation.wrapping_add(1),
        };
        let Slot::Occupied { value, .. } = std::mem::replace(slot, next) else {
            return None;
        };
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Removes every entry, keeping the slots for reuse.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let generation = match slot {
                Slot::Occupied { generation, .. } => *generation,
                Slot::Vacant { .. } => continue,
            };
            let next = Slot::Vacant {
                generation: generation.wrapping_add(1),
            };
            if let Slot::Occupied { value, .. } = std::mem::replace(slot, next) {
                out.push(value);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        out
    }

    fn reserve_slots(&mut self, count: usize) {
        let start = self.slots.len();
        self.slots.reserve_exact(count);
        self.slots
            .extend((0..count).map(|_| Slot::Vacant { generation: 0 }));
        // Lowest index on top so fresh slabs hand out slots in order.
        self.free.extend((start..start + count).rev().map(|i| i as u32));
    }
}
