#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// One mebibyte; configuration sizes are expressed in MiB.
pub const MIB: u64 = 1024 * 1024;

/// Index of a fixed-size block within a file (byte offset / block size).
///
/// A block index is only meaningful together with the block size of the pool
/// that produced it, and only for the lifetime of the open handle it belongs
/// to.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockIndex(pub u64);

impl BlockIndex {
    /// Block index covering `offset` for the given block size.
    #[must_use]
    pub fn from_offset(offset: u64, block_size: u64) -> Self {
        Self(offset / block_size)
    }

    /// Byte offset of the first byte of this block.
    #[must_use]
    pub fn to_offset(self, block_size: u64) -> u64 {
        self.0 * block_size
    }

    /// The index `lag` blocks behind this one, or `None` if that would
    /// underflow the start of the file.
    #[must_use]
    pub fn trailing(self, lag: u64) -> Option<Self> {
        self.0.checked_sub(lag).map(Self)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an open file handle.
///
/// Allocated from a process-global counter; the fd-to-handle identity map is
/// owned by the enclosing filesystem layer, not by this workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_index_from_offset_truncates() {
        let bs = 4 * MIB;
        assert_eq!(BlockIndex::from_offset(0, bs), BlockIndex(0));
        assert_eq!(BlockIndex::from_offset(bs - 1, bs), BlockIndex(0));
        assert_eq!(BlockIndex::from_offset(bs, bs), BlockIndex(1));
        assert_eq!(BlockIndex::from_offset(10 * bs + 17, bs), BlockIndex(10));
    }

    #[test]
    fn block_index_round_trips_to_offset() {
        let bs = 4 * MIB;
        assert_eq!(BlockIndex(7).to_offset(bs), 7 * bs);
        assert_eq!(BlockIndex::from_offset(BlockIndex(7).to_offset(bs), bs), BlockIndex(7));
    }

    #[test]
    fn trailing_saturates_at_file_start() {
        assert_eq!(BlockIndex(5).trailing(3), Some(BlockIndex(2)));
        assert_eq!(BlockIndex(3).trailing(3), Some(BlockIndex(0)));
        assert_eq!(BlockIndex(2).trailing(3), None);
    }
}
