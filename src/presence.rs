//! Presence bitmaps and the per-category hot-plug obligations derived from them.
//!
//! Every slot transition is broadcast to all categories of a zone. Each
//! category's poller then consumes its own added/removed entry once it has
//! refreshed or reset the attribute it owns, so one physical transition is
//! serviced exactly once per category no matter how many rounds pass first.

use std::fmt;
use std::marker::PhantomData;

/// Largest slot count any zone reports in one presence byte.
pub const MAX_SLOTS: usize = 8;

pub const MAX_PSU: usize = 6;
pub const MAX_FAN: usize = 6;
pub const MAX_DRAWER: usize = 4;
pub const MAX_SLED: usize = 8;

/// One bit per slot: bit i is slot i+1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceBitmap(u8);

impl PresenceBitmap {
    pub const EMPTY: PresenceBitmap = PresenceBitmap(0);

    /// Keep only the bits for the first `max` slots.
    pub fn new(raw: u8, max: usize) -> Self {
        debug_assert!(max <= MAX_SLOTS);
        let mask = if max >= MAX_SLOTS { 0xff } else { (1u8 << max) - 1 };
        Self(raw & mask)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// `index` is 0-based.
    pub fn is_present(self, index: usize) -> bool {
        index < MAX_SLOTS && (self.0 >> index) & 1 == 1
    }

    #[cfg(test)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// First present index strictly after `after` (or from 0 when None).
    pub fn next_present(self, after: Option<usize>) -> Option<usize> {
        let start = after.map_or(0, |i| i + 1);
        (start..MAX_SLOTS).find(|&i| self.is_present(i))
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_SLOTS).filter(move |&i| self.is_present(i))
    }
}

impl fmt::Display for PresenceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010b}", self.0)
    }
}

/// An attribute category fed by a zone's presence transitions.
pub trait Category: Copy + fmt::Debug + 'static {
    const ALL: &'static [Self];

    fn index(self) -> usize;
}

/// Slots that changed between two bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transitions {
    pub added: PresenceBitmap,
    pub removed: PresenceBitmap,
}

impl Transitions {
    pub fn between(previous: PresenceBitmap, current: PresenceBitmap, max: usize) -> Self {
        let changed = (previous.bits() ^ current.bits()) & PresenceBitmap::new(0xff, max).bits();
        Self {
            added: PresenceBitmap(changed & current.bits()),
            removed: PresenceBitmap(changed & previous.bits()),
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Added/removed flags, one row per category and one bit per slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotPlugFlags<C: Category> {
    added: Vec<u8>,
    removed: Vec<u8>,
    _category: PhantomData<C>,
}

impl<C: Category> Default for HotPlugFlags<C> {
    fn default() -> Self {
        Self {
            added: vec![0; C::ALL.len()],
            removed: vec![0; C::ALL.len()],
            _category: PhantomData,
        }
    }
}

impl<C: Category> HotPlugFlags<C> {
    /// Flags produced by a single diff from a clean slate.
    #[cfg(test)]
    pub fn diff(previous: PresenceBitmap, current: PresenceBitmap, max: usize) -> Self {
        let mut flags = Self::default();
        flags.apply(previous, current, max);
        flags
    }

    /// Broadcast every slot transition between `previous` and `current` to all
    /// categories. A slot that flips sets added (and clears removed) on gain,
    /// or the reverse on loss; untouched slots keep whatever is still pending.
    pub fn apply(&mut self, previous: PresenceBitmap, current: PresenceBitmap, max: usize) -> Transitions {
        let transitions = Transitions::between(previous, current, max);
        let changed = transitions.added.bits() | transitions.removed.bits();

        for row in 0..C::ALL.len() {
            self.added[row] = (self.added[row] & !changed) | transitions.added.bits();
            self.removed[row] = (self.removed[row] & !changed) | transitions.removed.bits();
        }
        transitions
    }

    pub fn mark_added(&mut self, category: C, slot: usize) {
        self.added[category.index()] |= 1 << slot;
        self.removed[category.index()] &= !(1 << slot);
    }

    #[cfg(test)]
    pub fn mark_removed(&mut self, category: C, slot: usize) {
        self.removed[category.index()] |= 1 << slot;
        self.added[category.index()] &= !(1 << slot);
    }

    pub fn is_added(&self, category: C, slot: usize) -> bool {
        (self.added[category.index()] >> slot) & 1 == 1
    }

    #[cfg(test)]
    pub fn is_removed(&self, category: C, slot: usize) -> bool {
        (self.removed[category.index()] >> slot) & 1 == 1
    }

    /// Clear this category's added flag for `slot`; true if it was set.
    pub fn consume_added(&mut self, category: C, slot: usize) -> bool {
        let was = self.is_added(category, slot);
        self.added[category.index()] &= !(1 << slot);
        was
    }

    /// Clear this category's removed flag for `slot`; true if it was set.
    #[cfg(test)]
    pub fn consume_removed(&mut self, category: C, slot: usize) -> bool {
        let was = self.is_removed(category, slot);
        self.removed[category.index()] &= !(1 << slot);
        was
    }

    /// Next slot strictly after `after` still waiting on an add refresh.
    pub fn next_added(&self, category: C, after: Option<usize>) -> Option<usize> {
        PresenceBitmap(self.added[category.index()]).next_present(after)
    }

    /// Consume and return every pending removal for `category`.
    pub fn drain_removed(&mut self, category: C) -> Vec<usize> {
        let pending = PresenceBitmap(self.removed[category.index()]);
        self.removed[category.index()] = 0;
        pending.iter().collect()
    }

    #[cfg(test)]
    pub fn is_clear(&self) -> bool {
        self.added.iter().chain(self.removed.iter()).all(|row| *row == 0)
    }
}

macro_rules! categories {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl Category for $name {
            const ALL: &'static [Self] = &[$($name::$variant),+];

            fn index(self) -> usize {
                self as usize
            }
        }
    };
}

categories! {
    /// PSU attributes refreshed on insertion and reset on removal.
    PsuAttr { Serial, Manufacturer, Model, Firmware, PowerCap, PowerIn, CurrentOut, PowerOut, Health }
}

categories! {
    FanAttr { Speed }
}

categories! {
    /// Drawer attributes. The identity pushes and network reads also get
    /// re-flagged when a drawer controller is seen to restart.
    DrawerAttr {
        Temperature,
        Health,
        Thermal,
        Power,
        Ruid,
        Bpid,
        Puid,
        IpAddress,
        IpSource,
        SubnetMask,
    }
}

categories! {
    /// Per-drawer sled attributes, fed by the sled bitmap in thermal reads.
    SledAttr { Kind, Power }
}
