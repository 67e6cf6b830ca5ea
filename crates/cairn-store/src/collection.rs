//! Block collection: a file of fixed-size blocks with bitmap allocation.

use std::path::Path;
use tracing::debug;

use cairn_common::{BlockBuffer, BlockHandle, CairnError, Result, StoreConfig};

use crate::bitmap::FreeSpaceBitmap;
use crate::file::BlockFile;

/// A collection of fixed-size blocks backed by a single file.
///
/// Block 0 holds the allocation bitmap and is never handed out. The bitmap
/// is kept in memory while the collection is open and written back to
/// block 0 on graceful close. The caller must have exclusive ownership of
/// the backing file while the collection is open; no file locking is
/// enforced.
pub struct BlockCollection {
    config: StoreConfig,
    inner: Option<CollectionInner>,
}

struct CollectionInner {
    file: BlockFile,
    bitmap: FreeSpaceBitmap,
    writable: bool,
}

impl BlockCollection {
    /// Opens an existing collection file, or creates one when writable.
    ///
    /// An empty file is initialised with a fresh bitmap in block 0 (bit 0
    /// set); a non-empty file has its bitmap read from block 0.
    pub fn open(path: impl AsRef<Path>, writable: bool, config: StoreConfig) -> Result<Self> {
        let file = BlockFile::open(path, config.block_size, writable, config.fsync_enabled)?;

        let bitmap = if file.num_blocks() == 0 {
            if !writable {
                return Err(CairnError::ReadOnly);
            }
            let mut bitmap = FreeSpaceBitmap::new(config.block_size);
            bitmap.set(0)?;
            write_bitmap(&file, &bitmap, config.block_size)?;
            bitmap
        } else {
            let mut buf = BlockBuffer::new();
            file.read_block(BlockHandle::BITMAP, &mut buf)?;
            FreeSpaceBitmap::from_bytes(buf.bytes())
        };

        Ok(Self {
            config,
            inner: Some(CollectionInner {
                file,
                bitmap,
                writable,
            }),
        })
    }

    /// Returns true while the collection is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns true if the collection accepts allocations and writes.
    pub fn is_writable(&self) -> bool {
        self.inner.as_ref().map_or(false, |inner| inner.writable)
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    /// Writes the bitmap back (when writable) and closes the file.
    ///
    /// Idempotent: closing a closed collection does nothing.
    pub fn close(&mut self) -> Result<()> {
        if let Some(inner) = self.inner.take() {
            if inner.writable {
                write_bitmap(&inner.file, &inner.bitmap, self.config.block_size)?;
                inner.file.sync()?;
            }
        }
        Ok(())
    }

    /// Allocates a free block and returns its handle. Never returns block 0.
    pub fn get_free_block(&mut self) -> Result<BlockHandle> {
        let inner = self.inner.as_mut().ok_or(CairnError::NotOpen)?;
        if !inner.writable {
            return Err(CairnError::ReadOnly);
        }

        let index = inner.bitmap.allocate().ok_or(CairnError::OutOfBlocks)?;
        debug!(block = index, "allocated block");
        Ok(BlockHandle::new(index))
    }

    /// Allocates a free block, zero-resizes `buf` to the block size, and
    /// stamps the fresh handle on it.
    pub fn get_free_block_buffer(&mut self, buf: &mut BlockBuffer) -> Result<BlockHandle> {
        let handle = self.get_free_block()?;
        buf.reset(self.config.block_size);
        buf.set_handle(handle);
        Ok(handle)
    }

    /// Releases a block back to the bitmap. Idempotent on free blocks.
    pub fn free_block(&mut self, handle: BlockHandle) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(CairnError::NotOpen)?;
        if !inner.writable {
            return Err(CairnError::ReadOnly);
        }
        if handle.is_bitmap() {
            return Err(CairnError::InvariantViolation("free of the bitmap block"));
        }

        inner.bitmap.release(handle.id())?;
        debug!(block = handle.id(), "freed block");
        Ok(())
    }

    /// Releases the block a buffer holds and clears the buffer's stamp.
    pub fn free_buffer(&mut self, buf: &mut BlockBuffer) -> Result<()> {
        let handle = buf
            .handle()
            .ok_or(CairnError::InvariantViolation("free of an unstamped buffer"))?;
        self.free_block(handle)?;
        buf.clear_handle();
        Ok(())
    }

    /// Reads the block at `handle` into `buf`.
    pub fn read_block(&self, handle: BlockHandle, buf: &mut BlockBuffer) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(CairnError::NotOpen)?;
        inner.file.read_block(handle, buf)
    }

    /// Writes a stamped buffer back to its block.
    pub fn write_block(&self, buf: &BlockBuffer) -> Result<()> {
        let inner = self.inner.as_ref().ok_or(CairnError::NotOpen)?;
        let handle = buf
            .handle()
            .ok_or(CairnError::InvariantViolation("write of an unstamped buffer"))?;
        inner.file.write_block(handle, buf.bytes())
    }

    /// Returns true if `handle` is currently marked allocated.
    pub fn is_allocated(&self, handle: BlockHandle) -> Result<bool> {
        let inner = self.inner.as_ref().ok_or(CairnError::NotOpen)?;
        Ok(inner.bitmap.is_set(handle.id()))
    }

    /// Returns all allocated handles in ascending order, including block 0.
    pub fn allocated_blocks(&self) -> Result<Vec<BlockHandle>> {
        let inner = self.inner.as_ref().ok_or(CairnError::NotOpen)?;
        Ok(inner
            .bitmap
            .set_indices()
            .into_iter()
            .map(BlockHandle::new)
            .collect())
    }
}

impl Drop for BlockCollection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn write_bitmap(file: &BlockFile, bitmap: &FreeSpaceBitmap, block_size: usize) -> Result<()> {
    let mut buf = BlockBuffer::new();
    buf.reset(block_size);
    buf.set_handle(BlockHandle::BITMAP);
    bitmap.write_to(buf.bytes_mut());
    file.write_block(BlockHandle::BITMAP, buf.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> StoreConfig {
        StoreConfig {
            block_size: 512,
            fsync_enabled: false,
        }
    }

    fn create_test_collection() -> (BlockCollection, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let collection =
            BlockCollection::open(dir.path().join("store.dat"), true, test_config()).unwrap();
        (collection, dir)
    }

    #[test]
    fn test_fresh_open_reserves_block_zero() {
        let (collection, _dir) = create_test_collection();
        assert!(collection.is_open());
        assert!(collection.is_writable());
        assert!(collection.is_allocated(BlockHandle::BITMAP).unwrap());
        assert_eq!(
            collection.allocated_blocks().unwrap(),
            vec![BlockHandle::BITMAP]
        );
    }

    #[test]
    fn test_allocation_never_returns_zero() {
        let (mut collection, _dir) = create_test_collection();
        for expected in 1..10u64 {
            let handle = collection.get_free_block().unwrap();
            assert_eq!(handle, BlockHandle::new(expected));
        }
    }

    #[test]
    fn test_free_then_reallocate_lowest() {
        let (mut collection, _dir) = create_test_collection();
        let handles: Vec<_> = (0..5)
            .map(|_| collection.get_free_block().unwrap())
            .collect();

        collection.free_block(handles[1]).unwrap();
        collection.free_block(handles[3]).unwrap();

        assert_eq!(collection.get_free_block().unwrap(), handles[1]);
        assert_eq!(collection.get_free_block().unwrap(), handles[3]);
        assert_eq!(collection.get_free_block().unwrap(), BlockHandle::new(6));
    }

    #[test]
    fn test_free_bitmap_block_rejected() {
        let (mut collection, _dir) = create_test_collection();
        let result = collection.free_block(BlockHandle::BITMAP);
        assert!(matches!(result, Err(CairnError::InvariantViolation(_))));
    }

    #[test]
    fn test_get_free_block_buffer_stamps_and_zeroes() {
        let (mut collection, _dir) = create_test_collection();

        let mut buf = BlockBuffer::new();
        buf.resize(16);
        buf.bytes_mut()[0] = 0xFF;

        let handle = collection.get_free_block_buffer(&mut buf).unwrap();
        assert_eq!(buf.handle(), Some(handle));
        assert_eq!(buf.len(), 512);
        assert!(buf.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (mut collection, _dir) = create_test_collection();

        let mut buf = BlockBuffer::new();
        let handle = collection.get_free_block_buffer(&mut buf).unwrap();
        buf.bytes_mut()[0] = 0x42;
        buf.bytes_mut()[511] = 0x24;
        collection.write_block(&buf).unwrap();

        let mut read_buf = BlockBuffer::new();
        collection.read_block(handle, &mut read_buf).unwrap();
        assert_eq!(read_buf.bytes()[0], 0x42);
        assert_eq!(read_buf.bytes()[511], 0x24);
    }

    #[test]
    fn test_write_unstamped_buffer_fails() {
        let (collection, _dir) = create_test_collection();
        let mut buf = BlockBuffer::new();
        buf.resize(512);
        let result = collection.write_block(&buf);
        assert!(matches!(result, Err(CairnError::InvariantViolation(_))));
    }

    #[test]
    fn test_free_buffer_clears_stamp() {
        let (mut collection, _dir) = create_test_collection();
        let mut buf = BlockBuffer::new();
        let handle = collection.get_free_block_buffer(&mut buf).unwrap();

        collection.free_buffer(&mut buf).unwrap();
        assert_eq!(buf.handle(), None);
        assert!(!collection.is_allocated(handle).unwrap());
    }

    #[test]
    fn test_bitmap_persists_across_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let first;
        let second;
        {
            let mut collection = BlockCollection::open(&path, true, test_config()).unwrap();
            first = collection.get_free_block().unwrap();
            second = collection.get_free_block().unwrap();
            collection.free_block(first).unwrap();
            collection.close().unwrap();
        }

        let mut collection = BlockCollection::open(&path, true, test_config()).unwrap();
        assert!(!collection.is_allocated(first).unwrap());
        assert!(collection.is_allocated(second).unwrap());
        assert_eq!(collection.get_free_block().unwrap(), first);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut collection, _dir) = create_test_collection();
        collection.close().unwrap();
        collection.close().unwrap();
        assert!(!collection.is_open());
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (mut collection, _dir) = create_test_collection();
        collection.close().unwrap();

        assert!(matches!(
            collection.get_free_block(),
            Err(CairnError::NotOpen)
        ));
        let mut buf = BlockBuffer::new();
        assert!(matches!(
            collection.read_block(BlockHandle::new(1), &mut buf),
            Err(CairnError::NotOpen)
        ));
        assert!(matches!(
            collection.free_block(BlockHandle::new(1)),
            Err(CairnError::NotOpen)
        ));
    }

    #[test]
    fn test_read_only_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let handle;
        {
            let mut collection = BlockCollection::open(&path, true, test_config()).unwrap();
            let mut buf = BlockBuffer::new();
            handle = collection.get_free_block_buffer(&mut buf).unwrap();
            buf.bytes_mut()[0] = 0x99;
            collection.write_block(&buf).unwrap();
            collection.close().unwrap();
        }

        let mut collection = BlockCollection::open(&path, false, test_config()).unwrap();
        assert!(!collection.is_writable());

        let mut buf = BlockBuffer::new();
        collection.read_block(handle, &mut buf).unwrap();
        assert_eq!(buf.bytes()[0], 0x99);

        assert!(matches!(
            collection.get_free_block(),
            Err(CairnError::ReadOnly)
        ));
        assert!(matches!(
            collection.free_block(handle),
            Err(CairnError::ReadOnly)
        ));
    }

    #[test]
    fn test_read_only_open_of_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = BlockCollection::open(dir.path().join("missing.dat"), false, test_config());
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_blocks() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            block_size: 8, // 64 blocks total, bit 0 reserved
            fsync_enabled: false,
        };
        let mut collection =
            BlockCollection::open(dir.path().join("tiny.dat"), true, config).unwrap();

        for _ in 0..63 {
            collection.get_free_block().unwrap();
        }
        assert!(matches!(
            collection.get_free_block(),
            Err(CairnError::OutOfBlocks)
        ));
    }
}
