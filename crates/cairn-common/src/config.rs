//! Configuration structures for Cairn.

use crate::block::BLOCK_SIZE;
use serde::{Deserialize, Serialize};

/// Configuration for a block collection file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Block size in bytes. Also determines the capacity of the allocation
    /// bitmap: `block_size * 8` blocks.
    pub block_size: usize,
    /// Enable fsync after block writes.
    pub fsync_enabled: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            fsync_enabled: true,
        }
    }
}

impl StoreConfig {
    /// Returns the number of blocks addressable under this configuration.
    pub fn block_capacity(&self) -> u64 {
        (self.block_size as u64) * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.block_size, BLOCK_SIZE);
        assert_eq!(config.block_size, 16384);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_store_config_custom() {
        let config = StoreConfig {
            block_size: 4096,
            fsync_enabled: false,
        };
        assert_eq!(config.block_size, 4096);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_block_capacity() {
        let config = StoreConfig::default();
        // One bit per block in a 16 KB bitmap block.
        assert_eq!(config.block_capacity(), 131072);

        let small = StoreConfig {
            block_size: 64,
            fsync_enabled: false,
        };
        assert_eq!(small.block_capacity(), 512);
    }

    #[test]
    fn test_store_config_clone() {
        let config1 = StoreConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.block_size, config2.block_size);
        assert_eq!(config1.fsync_enabled, config2.fsync_enabled);
    }

    #[test]
    fn test_store_config_serde_roundtrip() {
        let original = StoreConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StoreConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.block_size, deserialized.block_size);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
