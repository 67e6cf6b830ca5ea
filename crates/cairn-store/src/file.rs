//! Block file accessor for fixed-size block I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_common::{BlockBuffer, BlockHandle, CairnError, Result};

/// Reads and writes fixed-size blocks of a single backing file.
///
/// The block at handle `h` occupies file offset `h * block_size`. Writing
/// past the current end extends the file; reading a block that was never
/// written is an error.
pub struct BlockFile {
    /// File handle and length bookkeeping.
    inner: Mutex<FileInner>,
    /// Path to the backing file.
    path: PathBuf,
    /// Block size in bytes.
    block_size: usize,
    /// Whether the file was opened for writing.
    writable: bool,
    /// Enable fsync after writes.
    fsync_enabled: bool,
}

struct FileInner {
    file: File,
    num_blocks: u64,
}

impl BlockFile {
    /// Opens an existing file, or creates it when opened writable.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: usize,
        writable: bool,
        fsync_enabled: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_blocks = file_size / block_size as u64;

        Ok(Self {
            inner: Mutex::new(FileInner { file, num_blocks }),
            path,
            block_size,
            writable,
            fsync_enabled,
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns true if the file was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the number of blocks currently in the file.
    pub fn num_blocks(&self) -> u64 {
        self.inner.lock().num_blocks
    }

    /// Reads the block at `handle` into `buf` and stamps the handle.
    pub fn read_block(&self, handle: BlockHandle, buf: &mut BlockBuffer) -> Result<()> {
        let mut inner = self.inner.lock();

        if handle.id() >= inner.num_blocks {
            return Err(CairnError::HandleOutOfBounds {
                handle: handle.id(),
            });
        }

        buf.set_handle(handle);
        buf.resize(self.block_size);

        let offset = handle.id() * self.block_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(buf.bytes_mut())?;

        Ok(())
    }

    /// Writes `bytes` as the block at `handle`, extending the file if needed.
    pub fn write_block(&self, handle: BlockHandle, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CairnError::ReadOnly);
        }
        if bytes.len() != self.block_size {
            return Err(CairnError::BlockSizeMismatch {
                expected: self.block_size,
                actual: bytes.len(),
            });
        }

        let mut inner = self.inner.lock();

        let offset = handle.id() * self.block_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(bytes)?;

        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        if handle.id() >= inner.num_blocks {
            inner.num_blocks = handle.id() + 1;
        }

        Ok(())
    }

    /// Flushes pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        if self.writable {
            self.inner.lock().file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_BLOCK_SIZE: usize = 512;

    fn create_test_file() -> (BlockFile, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let file = BlockFile::open(dir.path().join("blocks.dat"), TEST_BLOCK_SIZE, true, false)
            .unwrap();
        (file, dir)
    }

    fn filled_block(byte: u8) -> Vec<u8> {
        vec![byte; TEST_BLOCK_SIZE]
    }

    #[test]
    fn test_open_creates_file() {
        let (file, dir) = create_test_file();
        assert!(dir.path().join("blocks.dat").exists());
        assert_eq!(file.num_blocks(), 0);
        assert_eq!(file.block_size(), TEST_BLOCK_SIZE);
        assert!(file.is_writable());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (file, _dir) = create_test_file();

        let mut data = filled_block(0);
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[TEST_BLOCK_SIZE - 1] = 0xEF;
        file.write_block(BlockHandle::new(0), &data).unwrap();

        let mut buf = BlockBuffer::new();
        file.read_block(BlockHandle::new(0), &mut buf).unwrap();
        assert_eq!(buf.handle(), Some(BlockHandle::new(0)));
        assert_eq!(buf.bytes()[0], 0xAB);
        assert_eq!(buf.bytes()[100], 0xCD);
        assert_eq!(buf.bytes()[TEST_BLOCK_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_write_extends_file() {
        let (file, _dir) = create_test_file();

        file.write_block(BlockHandle::new(5), &filled_block(0x55))
            .unwrap();
        assert_eq!(file.num_blocks(), 6);

        // Blocks in the gap read back as zeros.
        let mut buf = BlockBuffer::new();
        file.read_block(BlockHandle::new(2), &mut buf).unwrap();
        assert!(buf.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_past_end_fails() {
        let (file, _dir) = create_test_file();
        file.write_block(BlockHandle::new(0), &filled_block(1))
            .unwrap();

        let mut buf = BlockBuffer::new();
        let result = file.read_block(BlockHandle::new(1), &mut buf);
        assert!(matches!(
            result,
            Err(CairnError::HandleOutOfBounds { handle: 1 })
        ));
    }

    #[test]
    fn test_write_wrong_size_fails() {
        let (file, _dir) = create_test_file();
        let result = file.write_block(BlockHandle::new(0), &[0u8; 100]);
        assert!(matches!(result, Err(CairnError::BlockSizeMismatch { .. })));
    }

    #[test]
    fn test_overwrite_block() {
        let (file, _dir) = create_test_file();

        file.write_block(BlockHandle::new(0), &filled_block(0xAA))
            .unwrap();
        file.write_block(BlockHandle::new(0), &filled_block(0xBB))
            .unwrap();

        let mut buf = BlockBuffer::new();
        file.read_block(BlockHandle::new(0), &mut buf).unwrap();
        assert!(buf.bytes().iter().all(|&b| b == 0xBB));
        assert_eq!(file.num_blocks(), 1);
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");

        {
            let file = BlockFile::open(&path, TEST_BLOCK_SIZE, true, true).unwrap();
            file.write_block(BlockHandle::new(3), &filled_block(0xFF))
                .unwrap();
        }

        let file = BlockFile::open(&path, TEST_BLOCK_SIZE, false, false).unwrap();
        assert_eq!(file.num_blocks(), 4);
        assert!(!file.is_writable());

        let mut buf = BlockBuffer::new();
        file.read_block(BlockHandle::new(3), &mut buf).unwrap();
        assert!(buf.bytes().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_read_only_write_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blocks.dat");
        {
            let file = BlockFile::open(&path, TEST_BLOCK_SIZE, true, false).unwrap();
            file.write_block(BlockHandle::new(0), &filled_block(1))
                .unwrap();
        }

        let file = BlockFile::open(&path, TEST_BLOCK_SIZE, false, false).unwrap();
        let result = file.write_block(BlockHandle::new(0), &filled_block(2));
        assert!(matches!(result, Err(CairnError::ReadOnly)));
    }

    #[test]
    fn test_sync() {
        let (file, _dir) = create_test_file();
        file.write_block(BlockHandle::new(0), &filled_block(7))
            .unwrap();
        file.sync().unwrap();
    }
}
