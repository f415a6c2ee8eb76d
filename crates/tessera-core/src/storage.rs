//! Byte storage behind tensors and scratchpads
//!
//! [`MemoryStorage`] is a reference-counted, lock-guarded byte buffer. A
//! [`StorageView`] is a bounds-checked window into one, and [`Memory`] pairs
//! a view with the [`MemoryDesc`] describing its contents. Views are cheap to
//! clone and never copy data, which lets the convolution pipeline rebind a
//! caller buffer to a reinterpreted descriptor or carve scratch regions out of
//! a single allocation.
//!
//! Typed access goes through `bytemuck`, so any `Pod` element type can be
//! loaded and stored without `unsafe`.

use crate::error::{Error, Result};
use crate::memory_desc::MemoryDesc;
use bytemuck::Pod;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared, zero-initialised byte buffer
#[derive(Clone)]
pub struct MemoryStorage {
    id: u64,
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryStorage {
    /// Allocate `size` zeroed bytes.
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0u8; size])
    }

    /// Allocate `size` zeroed bytes, reporting allocation failure as
    /// [`Error::OutOfMemory`] instead of aborting.
    pub fn try_new(size: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory { requested: size })?;
        bytes.resize(size, 0);
        Ok(Self::from_bytes(bytes))
    }

    /// Copy typed data into a new storage.
    pub fn from_slice<T: Pod>(data: &[T]) -> Self {
        Self::from_bytes(bytemuck::cast_slice::<T, u8>(data).to_vec())
    }

    fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            data: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Process-unique identifier of this storage.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View over the whole storage.
    pub fn view(&self) -> StorageView {
        let len = self.len();
        StorageView {
            storage: self.clone(),
            offset: 0,
            len,
        }
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Bounds-checked window `[offset, offset + len)` into a [`MemoryStorage`]
#[derive(Debug, Clone)]
pub struct StorageView {
    storage: MemoryStorage,
    offset: usize,
    len: usize,
}

impl StorageView {
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Byte offset of this view inside its storage.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Narrow the view to `[offset, offset + len)` relative to its start.
    pub fn sub_view(&self, offset: usize, len: usize) -> Result<StorageView> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::invalid(format!("sub-view range overflows: {offset} + {len}")))?;
        if end > self.len {
            return Err(Error::invalid(format!(
                "sub-view [{offset}, {end}) exceeds view length {}",
                self.len
            )));
        }
        Ok(StorageView {
            storage: self.storage.clone(),
            offset: self.offset + offset,
            len,
        })
    }

    /// Whether both views point into the same storage.
    pub fn same_storage(&self, other: &StorageView) -> bool {
        self.storage.id == other.storage.id
    }

    /// Copy the view out as raw bytes.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let data = self.storage.data.read();
        let end = self.offset + self.len;
        if end > data.len() {
            return Err(Error::runtime(format!(
                "view [{}, {end}) exceeds storage of {} bytes",
                self.offset,
                data.len()
            )));
        }
        Ok(data[self.offset..end].to_vec())
    }

    /// Copy `bytes` to the start of the view.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.len {
            return Err(Error::runtime(format!(
                "write of {} bytes exceeds view length {}",
                bytes.len(),
                self.len
            )));
        }
        let mut data = self.storage.data.write();
        let end = self.offset + bytes.len();
        if end > data.len() {
            return Err(Error::runtime(format!(
                "write [{}, {end}) exceeds storage of {} bytes",
                self.offset,
                data.len()
            )));
        }
        data[self.offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Load the whole view as elements of `T`.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        let elem = std::mem::size_of::<T>();
        if elem == 0 || self.len % elem != 0 {
            return Err(Error::runtime(format!(
                "view length {} is not a multiple of element size {elem}",
                self.len
            )));
        }
        let bytes = self.read_bytes()?;
        Ok(bytes.chunks_exact(elem).map(bytemuck::pod_read_unaligned::<T>).collect())
    }

    /// Store `values` at the start of the view.
    pub fn write<T: Pod>(&self, values: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice::<T, u8>(values))
    }

    /// Zero the whole view.
    pub fn fill_zero(&self) -> Result<()> {
        self.write_bytes(&vec![0u8; self.len])
    }
}

/// A tensor: descriptor plus the bytes it describes
#[derive(Debug, Clone)]
pub struct Memory {
    desc: MemoryDesc,
    view: StorageView,
}

impl Memory {
    /// Bind `desc` to `view`. The view must hold at least `desc.size()` bytes
    /// and the descriptor must be concrete.
    pub fn new(desc: MemoryDesc, view: StorageView) -> Result<Self> {
        if desc.is_any() {
            return Err(Error::invalid(format!("cannot bind memory to unresolved descriptor {desc}")));
        }
        if view.len() < desc.size() {
            return Err(Error::invalid(format!(
                "buffer of {} bytes too small for {desc} ({} bytes)",
                view.len(),
                desc.size()
            )));
        }
        Ok(Self { desc, view })
    }

    /// Allocate zeroed storage sized for `desc`.
    pub fn allocate(desc: MemoryDesc) -> Result<Self> {
        let storage = MemoryStorage::try_new(desc.size())?;
        Self::new(desc, storage.view())
    }

    /// Allocate storage for `desc` and fill it with `values`.
    pub fn from_data<T: Pod>(desc: MemoryDesc, values: &[T]) -> Result<Self> {
        let memory = Self::allocate(desc)?;
        memory.view.write(values)?;
        Ok(memory)
    }

    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    pub fn view(&self) -> &StorageView {
        &self.view
    }

    /// Same bytes seen through another descriptor.
    pub fn reinterpret(&self, desc: MemoryDesc) -> Result<Self> {
        Self::new(desc, self.view.clone())
    }

    /// Load the descriptor's byte span as elements of `T`.
    pub fn read<T: Pod>(&self) -> Result<Vec<T>> {
        self.view.sub_view(0, self.desc.size())?.read()
    }

    /// Store `values` at the start of the buffer.
    pub fn write<T: Pod>(&self, values: &[T]) -> Result<()> {
        self.view.write(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_round_trip_typed_data() -> Result<()> {
        let storage = MemoryStorage::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        assert_eq!(storage.len(), 16);
        assert_eq!(storage.view().read::<f32>()?, vec![1.0, 2.0, 3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_sub_views_are_windows() -> Result<()> {
        let storage = MemoryStorage::new(32);
        let view = storage.view();
        let tail = view.sub_view(16, 16)?;
        tail.write(&[7.0f32, 8.0])?;
        assert_eq!(tail.offset(), 16);
        assert!(tail.same_storage(&view));

        let all = view.read::<f32>()?;
        assert_eq!(&all[..4], &[0.0; 4]);
        assert_eq!(&all[4..6], &[7.0, 8.0]);
        Ok(())
    }

    #[test]
    fn test_sub_view_bounds() {
        let view = MemoryStorage::new(8).view();
        assert!(view.sub_view(4, 8).is_err());
        assert!(view.sub_view(usize::MAX, 2).is_err());
        assert!(view.sub_view(8, 0).is_ok());
    }

    #[test]
    fn test_write_overflow_is_rejected() {
        let view = MemoryStorage::new(8).view();
        assert!(view.write(&[0u32; 3]).is_err());
    }

    #[test]
    fn test_read_requires_whole_elements() {
        let view = MemoryStorage::new(6).view();
        assert!(view.read::<f32>().is_err());
        assert!(view.read::<u16>().is_ok());
    }

    #[test]
    fn test_memory_size_check() -> Result<()> {
        let desc = MemoryDesc::plain(vec![2, 4], DataType::F32)?;
        let small = MemoryStorage::new(16).view();
        assert!(Memory::new(desc.clone(), small).is_err());

        let memory = Memory::from_data(desc, &[1.0f32; 8])?;
        assert_eq!(memory.read::<f32>()?, vec![1.0; 8]);
        Ok(())
    }

    #[test]
    fn test_reinterpret_shares_storage() -> Result<()> {
        let desc = MemoryDesc::plain(vec![2, 4], DataType::F32)?;
        let memory = Memory::from_data(desc, &[0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])?;
        let flat = memory.reinterpret(MemoryDesc::plain(vec![8], DataType::F32)?)?;
        flat.write(&[9.0f32])?;
        assert_eq!(memory.read::<f32>()?[0], 9.0);
        Ok(())
    }

    #[test]
    fn test_any_descriptor_cannot_be_bound() -> Result<()> {
        let desc = MemoryDesc::any(vec![4], DataType::F32)?;
        assert!(Memory::new(desc, MemoryStorage::new(16).view()).is_err());
        Ok(())
    }
}
