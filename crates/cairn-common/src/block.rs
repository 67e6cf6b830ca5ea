//! Block handles and block buffers for Cairn storage.

use serde::{Deserialize, Serialize};

/// Default block size in bytes (16 KB).
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Identifier of a single block in a block collection file.
///
/// Block allocation is administered by the block collection, so handles
/// carry no arithmetic meaning beyond `handle * block_size` being the file
/// offset of the block. Handle 0 is reserved for the allocation bitmap and
/// is never handed out to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHandle(u64);

impl BlockHandle {
    /// The reserved handle of the allocation bitmap block.
    pub const BITMAP: BlockHandle = BlockHandle(0);

    /// Creates a handle from a raw block index.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw block index.
    pub fn id(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the reserved bitmap handle.
    pub fn is_bitmap(&self) -> bool {
        self.0 == 0
    }

    /// Serializes the handle to little-endian bytes.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Deserializes a handle from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte buffer holding the contents of a single block.
///
/// Created empty; the block collection resizes it to the block size on
/// read or allocation and stamps the handle of the block it holds. The
/// buffer is exclusively owned by its caller between acquisition and
/// write/free.
#[derive(Debug, Default)]
pub struct BlockBuffer {
    bytes: Vec<u8>,
    handle: Option<BlockHandle>,
}

impl BlockBuffer {
    /// Creates an empty, unstamped buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the byte size of the buffer.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Resizes the buffer, zero-filling any bytes grown.
    pub fn resize(&mut self, size: usize) {
        self.bytes.resize(size, 0);
    }

    /// Resizes the buffer to `size` bytes, all zero.
    pub fn reset(&mut self, size: usize) {
        self.bytes.clear();
        self.bytes.resize(size, 0);
    }

    /// Returns the buffer contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the buffer contents mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Returns the handle of the block this buffer holds, if stamped.
    pub fn handle(&self) -> Option<BlockHandle> {
        self.handle
    }

    /// Stamps the handle of the block this buffer holds.
    pub fn set_handle(&mut self, handle: BlockHandle) {
        self.handle = Some(handle);
    }

    /// Removes the handle stamp, e.g. after the block was freed.
    pub fn clear_handle(&mut self) {
        self.handle = None;
    }
}
