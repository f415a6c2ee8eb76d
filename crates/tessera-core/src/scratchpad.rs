//! Scratchpad planning
//!
//! Primitives declare their temporary-buffer needs at creation time by
//! booking named regions in a [`ScratchpadRegistry`]. A composite primitive
//! books its own regions and then embeds each sub-primitive's registry under
//! a [`Key::Nested`] slot, which turns the registry into a tree of arenas.
//!
//! At execution the caller provides one allocation of
//! [`ScratchpadRegistry::size`] bytes; a [`Grantor`] resolves keys to
//! non-overlapping windows of it, and [`Grantor::nested`] hands a
//! sub-primitive a grantor over exactly its own slot.
//!
//! ```rust
//! use tessera_core::scratchpad::{Key, Nested, ScratchpadRegistry};
//!
//! let mut child = ScratchpadRegistry::new();
//! child.registrar().book(Key::ConvAccumulator, 10, 4)?;
//!
//! let mut parent = ScratchpadRegistry::new();
//! let mut registrar = parent.registrar();
//! registrar.book(Key::ConvNcspSrc, 256, 4)?;
//! registrar.book_nested(Key::Nested(Nested::Compute), &child)?;
//!
//! assert_eq!(parent.size(), 1024 + 64);
//! # Ok::<(), tessera_core::Error>(())
//! ```

use crate::error::{Error, Result};
use crate::storage::{MemoryStorage, StorageView};

/// Alignment (and capacity granularity) of every booked region.
pub const SCRATCHPAD_ALIGNMENT: usize = 64;

/// Slots for composed sub-primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Nested {
    Compute,
    SrcReorder,
    DstPreReorder,
    DstPostReorder,
    DiffSrcReorder,
    DiffDstReorder,
}

/// Closed set of scratchpad region names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// Channel-last copy of the source activation
    ConvNcspSrc,
    /// Channel-last copy of the destination activation
    ConvNcspDst,
    /// Channel-last copy of the source gradient
    ConvNcspDiffSrc,
    /// Channel-last copy of the destination gradient
    ConvNcspDiffDst,
    /// Output accumulator of a matmul kernel
    MatmulAccumulator,
    /// Output accumulator of a convolution kernel
    ConvAccumulator,
    /// Registry of a composed sub-primitive
    Nested(Nested),
}

/// Placement of one booked region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Byte offset from the start of the owning registry
    pub offset: usize,
    /// Requested size in bytes
    pub size: usize,
    /// Reserved bytes, `size` rounded up to the alignment
    pub capacity: usize,
    pub alignment: usize,
}

#[derive(Debug, Clone)]
struct Slot {
    key: Key,
    entry: Entry,
    child: Option<ScratchpadRegistry>,
}

/// Ordered map from [`Key`] to region placement
#[derive(Debug, Clone, Default)]
pub struct ScratchpadRegistry {
    slots: Vec<Slot>,
    size: usize,
}

static EMPTY_REGISTRY: ScratchpadRegistry = ScratchpadRegistry::new();

impl ScratchpadRegistry {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            size: 0,
        }
    }

    /// Handle used to book regions.
    pub fn registrar(&mut self) -> Registrar<'_> {
        Registrar { registry: self }
    }

    /// Total bytes required, nested registries included.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Booked keys in booking order.
    pub fn keys(&self) -> Vec<Key> {
        self.slots.iter().map(|slot| slot.key).collect()
    }

    pub fn entry(&self, key: Key) -> Option<&Entry> {
        self.slot(key).map(|slot| &slot.entry)
    }

    /// Registry embedded under a nested key.
    pub fn nested(&self, key: Key) -> Option<&ScratchpadRegistry> {
        self.slot(key).and_then(|slot| slot.child.as_ref())
    }

    /// Allocate one zeroed buffer large enough for the whole tree.
    pub fn allocate(&self) -> Result<MemoryStorage> {
        MemoryStorage::try_new(self.size)
    }

    fn slot(&self, key: Key) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.key == key)
    }

    fn insert(&mut self, key: Key, size: usize, alignment: usize, child: Option<ScratchpadRegistry>) -> Result<()> {
        if !alignment.is_power_of_two() {
            return Err(Error::invalid(format!("scratchpad alignment {alignment} is not a power of two")));
        }
        if self.slot(key).is_some() {
            return Err(Error::invalid(format!("scratchpad key {key:?} booked twice")));
        }

        let overflow = || Error::OutOfMemory { requested: usize::MAX };
        let offset = align_up(self.size, alignment).ok_or_else(overflow)?;
        let capacity = align_up(size, alignment).ok_or_else(overflow)?;
        let end = offset.checked_add(capacity).ok_or_else(overflow)?;

        self.slots.push(Slot {
            key,
            entry: Entry {
                offset,
                size,
                capacity,
                alignment,
            },
            child,
        });
        self.size = end;
        Ok(())
    }
}

/// Booking handle over a registry
pub struct Registrar<'a> {
    registry: &'a mut ScratchpadRegistry,
}

impl Registrar<'_> {
    /// Book `nelems * elem_size` bytes under `key`. Zero-sized requests are
    /// not recorded.
    pub fn book(&mut self, key: Key, nelems: usize, elem_size: usize) -> Result<()> {
        self.book_with_alignment(key, nelems, elem_size, SCRATCHPAD_ALIGNMENT)
    }

    /// Book with an explicit power-of-two alignment.
    pub fn book_with_alignment(&mut self, key: Key, nelems: usize, elem_size: usize, alignment: usize) -> Result<()> {
        let size = nelems
            .checked_mul(elem_size)
            .ok_or(Error::OutOfMemory { requested: usize::MAX })?;
        if size == 0 {
            return Ok(());
        }
        self.registry.insert(key, size, alignment.max(SCRATCHPAD_ALIGNMENT), None)
    }

    /// Embed a sub-primitive's registry under `key`. Empty registries are
    /// not recorded.
    pub fn book_nested(&mut self, key: Key, child: &ScratchpadRegistry) -> Result<()> {
        if child.size() == 0 {
            return Ok(());
        }
        self.registry
            .insert(key, child.size(), SCRATCHPAD_ALIGNMENT, Some(child.clone()))
    }
}

/// Resolves keys of a registry to windows of one scratchpad allocation
#[derive(Debug, Clone)]
pub struct Grantor<'a> {
    registry: &'a ScratchpadRegistry,
    base: Option<StorageView>,
}

impl<'a> Grantor<'a> {
    /// Grantor over `base`, which must cover the registry's full size.
    pub fn new(registry: &'a ScratchpadRegistry, base: Option<StorageView>) -> Result<Self> {
        let required = registry.size();
        if required > 0 {
            match &base {
                Some(view) if view.len() >= required => {}
                Some(view) => {
                    return Err(Error::runtime(format!(
                        "scratchpad of {} bytes too small, {required} required",
                        view.len()
                    )));
                }
                None => {
                    return Err(Error::runtime(format!("scratchpad of {required} bytes required, none provided")));
                }
            }
        }
        Ok(Self { registry, base })
    }

    /// Grantor that owns no regions.
    pub fn empty() -> Grantor<'static> {
        Grantor {
            registry: &EMPTY_REGISTRY,
            base: None,
        }
    }

    pub fn registry(&self) -> &'a ScratchpadRegistry {
        self.registry
    }

    /// Window of exactly the requested size for `key`.
    pub fn get(&self, key: Key) -> Result<StorageView> {
        let entry = self
            .registry
            .entry(key)
            .ok_or_else(|| Error::runtime(format!("scratchpad key {key:?} was not booked")))?;
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| Error::runtime(format!("no scratchpad bound for key {key:?}")))?;
        base.sub_view(entry.offset, entry.size)
    }

    /// Grantor for the sub-primitive booked under `key`. A key that was
    /// never booked (the sub-primitive needs no scratch) yields an empty
    /// grantor.
    pub fn nested(&self, key: Key) -> Result<Grantor<'a>> {
        let registry = self.registry;
        let Some(slot) = registry.slot(key) else {
            return Ok(Grantor::empty());
        };
        let Some(child) = slot.child.as_ref() else {
            return Err(Error::runtime(format!("scratchpad key {key:?} is not a nested registry")));
        };
        let view = match &self.base {
            Some(base) => base.sub_view(slot.entry.offset, slot.entry.capacity)?,
            None => return Err(Error::runtime(format!("no scratchpad bound for key {key:?}"))),
        };
        Grantor::new(child, Some(view))
    }
}

fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_cumulative_and_aligned() -> Result<()> {
        let mut registry = ScratchpadRegistry::new();
        let mut registrar = registry.registrar();
        registrar.book(Key::ConvNcspDst, 10, 4)?;
        registrar.book(Key::ConvNcspSrc, 256, 4)?;

        let dst = registry.entry(Key::ConvNcspDst).copied();
        let src = registry.entry(Key::ConvNcspSrc).copied();
        assert_eq!(
            dst,
            Some(Entry {
                offset: 0,
                size: 40,
                capacity: 64,
                alignment: 64
            })
        );
        assert_eq!(src.map(|e| (e.offset, e.size)), Some((64, 1024)));
        assert_eq!(registry.size(), 64 + 1024);
        assert_eq!(registry.keys(), vec![Key::ConvNcspDst, Key::ConvNcspSrc]);
        Ok(())
    }

    #[test]
    fn test_zero_sized_bookings_are_skipped() -> Result<()> {
        let mut registry = ScratchpadRegistry::new();
        registry.registrar().book(Key::ConvNcspSrc, 0, 4)?;
        registry
            .registrar()
            .book_nested(Key::Nested(Nested::Compute), &ScratchpadRegistry::new())?;
        assert!(registry.is_empty());
        assert_eq!(registry.size(), 0);
        Ok(())
    }

    #[test]
    fn test_duplicate_key_rejected() -> Result<()> {
        let mut registry = ScratchpadRegistry::new();
        registry.registrar().book(Key::ConvNcspSrc, 1, 4)?;
        let err = registry.registrar().book(Key::ConvNcspSrc, 1, 4);
        assert!(matches!(err, Err(Error::InvalidArguments(_))));
        Ok(())
    }

    #[test]
    fn test_overflow_is_resource_exhaustion() {
        let mut registry = ScratchpadRegistry::new();
        let err = registry.registrar().book(Key::ConvNcspSrc, usize::MAX, 4);
        assert!(matches!(err, Err(Error::OutOfMemory { .. })));
    }

    #[test]
    fn test_nested_grantor_sees_child_window() -> Result<()> {
        let mut child = ScratchpadRegistry::new();
        child.registrar().book(Key::MatmulAccumulator, 4, 4)?;

        let mut parent = ScratchpadRegistry::new();
        let mut registrar = parent.registrar();
        registrar.book(Key::ConvNcspSrc, 16, 4)?;
        registrar.book_nested(Key::Nested(Nested::Compute), &child)?;

        let storage = parent.allocate()?;
        let grantor = Grantor::new(&parent, Some(storage.view()))?;
        let nested = grantor.nested(Key::Nested(Nested::Compute))?;
        let acc = nested.get(Key::MatmulAccumulator)?;
        assert_eq!(acc.offset(), 64);
        assert_eq!(acc.len(), 16);

        acc.write(&[1.0f32, 2.0, 3.0, 4.0])?;
        let src = grantor.get(Key::ConvNcspSrc)?;
        assert_eq!(src.read::<f32>()?, vec![0.0; 16]);
        Ok(())
    }

    #[test]
    fn test_unbooked_nested_key_is_empty() -> Result<()> {
        let registry = ScratchpadRegistry::new();
        let grantor = Grantor::new(&registry, None)?;
        let nested = grantor.nested(Key::Nested(Nested::SrcReorder))?;
        assert_eq!(nested.registry().size(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_key_is_runtime_error() -> Result<()> {
        let registry = ScratchpadRegistry::new();
        let grantor = Grantor::new(&registry, None)?;
        let err = grantor.get(Key::ConvNcspDst);
        assert!(matches!(err, Err(Error::Runtime(_))));
        Ok(())
    }

    #[test]
    fn test_undersized_base_is_rejected() -> Result<()> {
        let mut registry = ScratchpadRegistry::new();
        registry.registrar().book(Key::ConvNcspDst, 32, 4)?;
        let small = MemoryStorage::new(64);
        assert!(Grantor::new(&registry, Some(small.view())).is_err());
        assert!(Grantor::new(&registry, None).is_err());
        Ok(())
    }
}
