//! Positional gene storage.

use crate::protocol::BURST_GENE_LIMIT;

/// Ring of slots addressed by absolute gene position.
///
/// Accepts positions in `[base, base + capacity)`. Advancing the base releases the slots
/// below it for reuse by higher positions.
#[derive(Debug)]
pub struct GeneWindow<T> {
    slots: Vec<Option<T>>,
    base: i32,
    len: usize,
}

impl<T> GeneWindow<T> {
    /// Create a window accepting `capacity` positions starting at 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            base: 0,
            len: 0,
        }
    }

    /// Number of positions the window can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Lowest addressable position.
    #[must_use]
    pub const fn base(&self) -> i32 {
        self.base
    }

    /// First position past the window.
    #[must_use]
    pub fn limit(&self) -> i32 {
        self.base
            .saturating_add(i32::try_from(self.capacity()).unwrap_or(i32::MAX))
    }

    /// Occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Check whether no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check whether `position` is addressable.
    #[must_use]
    pub fn accepts(&self, position: i32) -> bool {
        position >= self.base && position < self.limit()
    }

    fn index(&self, position: i32) -> Option<usize> {
        if !self.accepts(position) {
            return None;
        }
        let position = usize::try_from(position).ok()?;
        Some(position % self.capacity())
    }

    /// Entry at `position`.
    #[must_use]
    pub fn get(&self, position: i32) -> Option<&T> {
        self.index(position)
            .and_then(|index| self.slots[index].as_ref())
    }

    /// Mutable entry at `position`.
    pub fn get_mut(&mut self, position: i32) -> Option<&mut T> {
        let index = self.index(position)?;
        self.slots[index].as_mut()
    }

    /// Store `value` at an empty addressable `position`; hands it back otherwise.
    pub fn insert(&mut self, position: i32, value: T) -> Result<(), T> {
        let Some(index) = self.index(position) else {
            return Err(value);
        };
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Err(value);
        }
        *slot = Some(value);
        self.len += 1;
        Ok(())
    }

    /// Take the entry at `position`.
    pub fn remove(&mut self, position: i32) -> Option<T> {
        let index = self.index(position)?;
        let value = self.slots[index].take();
        if value.is_some() {
            self.len -= 1;
        }
        value
    }

    /// Move the base forward to `position`, dropping every entry below it.
    pub fn advance_to(&mut self, position: i32) {
        while self.base < position {
            if self.len == 0 {
                self.base = position;
                break;
            }
            self.remove(self.base);
            self.base += 1;
        }
    }

    /// Move the base over empty slots, but not past `limit`.
    pub fn slide(&mut self, limit: i32) {
        while self.base < limit && self.get(self.base).is_none() {
            self.base += 1;
        }
    }

    /// Occupied entries in position order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &T)> + '_ {
        (self.base..self.limit()).filter_map(move |position| {
            self.get(position).map(|value| (position, value))
        })
    }

    /// Mutable occupied entries in position order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (i32, &mut T)> + '_ {
        let base = self.base;
        let capacity = self.capacity();
        let start = usize::try_from(base).unwrap_or(0) % capacity;
        let (tail, head) = self.slots.split_at_mut(start);
        head.iter_mut()
            .chain(tail.iter_mut())
            .zip(base..)
            .filter_map(|(slot, position)| slot.as_mut().map(|value| (position, value)))
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.len = 0;
    }

    /// Take every entry, in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        self.len = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

/// Gene storage of a transmission: inline slots for bursts, a window otherwise.
#[derive(Debug)]
pub enum GeneStore<T> {
    /// Up to three genes addressed directly.
    Burst([Option<T>; BURST_GENE_LIMIT]),
    /// Block or stream genes.
    Window(GeneWindow<T>),
}

impl<T> GeneStore<T> {
    /// Empty inline storage.
    #[must_use]
    pub fn burst() -> Self {
        Self::Burst([None, None, None])
    }

    /// Empty windowed storage.
    #[must_use]
    pub fn window(capacity: usize) -> Self {
        Self::Window(GeneWindow::new(capacity))
    }

    /// Entry at `position`.
    #[must_use]
    pub fn get(&self, position: i32) -> Option<&T> {
        match self {
            Self::Burst(slots) => usize::try_from(position)
                .ok()
                .and_then(|index| slots.get(index))
                .and_then(Option::as_ref),
            Self::Window(window) => window.get(position),
        }
    }

    /// Mutable entry at `position`.
    pub fn get_mut(&mut self, position: i32) -> Option<&mut T> {
        match self {
            Self::Burst(slots) => usize::try_from(position)
                .ok()
                .and_then(|index| slots.get_mut(index))
                .and_then(Option::as_mut),
            Self::Window(window) => window.get_mut(position),
        }
    }

    /// Store `value` at an empty addressable `position`.
    pub fn insert(&mut self, position: i32, value: T) -> Result<(), T> {
        match self {
            Self::Burst(slots) => {
                let Some(slot) = usize::try_from(position)
                    .ok()
                    .and_then(|index| slots.get_mut(index))
                else {
                    return Err(value);
                };
                if slot.is_some() {
                    return Err(value);
                }
                *slot = Some(value);
                Ok(())
            }
            Self::Window(window) => window.insert(position, value),
        }
    }

    /// Take the entry at `position`.
    pub fn remove(&mut self, position: i32) -> Option<T> {
        match self {
            Self::Burst(slots) => usize::try_from(position)
                .ok()
                .and_then(|index| slots.get_mut(index))
                .and_then(Option::take),
            Self::Window(window) => window.remove(position),
        }
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Burst(slots) => slots.iter().filter(|slot| slot.is_some()).count(),
            Self::Window(window) => window.len(),
        }
    }

    /// Check whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored entries in position order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (i32, &T)> + '_> {
        match self {
            Self::Burst(slots) => Box::new(
                slots
                    .iter()
                    .zip(0..)
                    .filter_map(|(slot, position)| slot.as_ref().map(|value| (position, value))),
            ),
            Self::Window(window) => Box::new(window.iter()),
        }
    }

    /// Mutable stored entries in position order.
    pub fn iter_mut(&mut self) -> Box<dyn Iterator<Item = (i32, &mut T)> + '_> {
        match self {
            Self::Burst(slots) => Box::new(
                slots
                    .iter_mut()
                    .zip(0..)
                    .filter_map(|(slot, position)| slot.as_mut().map(|value| (position, value))),
            ),
            Self::Window(window) => Box::new(window.iter_mut()),
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        match self {
            Self::Burst(slots) => slots.iter_mut().for_each(|slot| *slot = None),
            Self::Window(window) => window.clear(),
        }
    }

    /// Take every entry.
    pub fn drain(&mut self) -> Vec<T> {
        match self {
            Self::Burst(slots) => slots.iter_mut().filter_map(Option::take).collect(),
            Self::Window(window) => window.drain(),
        }
    }

    /// Lowest position that may still hold an entry.
    #[must_use]
    pub fn base(&self) -> i32 {
        match self {
            Self::Burst(_) => 0,
            Self::Window(window) => window.base(),
        }
    }

    /// Check whether `position` can be stored.
    #[must_use]
    pub fn accepts(&self, position: i32) -> bool {
        match self {
            Self::Burst(_) => usize::try_from(position).is_ok_and(|index| index < BURST_GENE_LIMIT),
            Self::Window(window) => window.accepts(position),
        }
    }

    /// Slide a window base over empty slots up to `limit`.
    pub fn slide(&mut self, limit: i32) {
        if let Self::Window(window) = self {
            window.slide(limit);
        }
    }
}
