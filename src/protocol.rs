//! Wire-level constants and plain data shared with the master and the
//! chunkservers. The actual packet framing lives in the transport layer and
//! is not part of this crate; everything here is the typed view both sides
//! agree on.

use bitflags::bitflags;

/// Size of a single block - the unit of CRC coverage and of write alignment.
pub const BLOCK_SIZE: u32 = 65536;

/// Number of blocks in a chunk.
pub const BLOCKS_IN_CHUNK: u32 = 1024;

/// Size of a whole chunk (64 MiB).
pub const CHUNK_SIZE: u32 = BLOCK_SIZE * BLOCKS_IN_CHUNK;

/// Maximum file size the master accepts.
pub const MAX_FILE_SIZE: u64 = (CHUNK_SIZE as u64) << 31;

/// Maximum length of a directory entry name.
pub const NAME_MAX: usize = 255;

/// Maximum length of an xattr name.
pub const XATTR_NAME_MAX: usize = 255;

/// Maximum size of an xattr value.
pub const XATTR_SIZE_MAX: usize = 65536;

/// Maximum size of an xattr list.
pub const XATTR_LIST_MAX: usize = 65536;

/// Inode numbers are 32 bit on the wire.
pub type Inode = u32;

/// The filesystem root.
pub const ROOT_INODE: Inode = 1;

/// Everything above this is reserved for special files.
pub const MAX_REGULAR_INODE: Inode = 0x7FFF_FFF0;

pub const SPECIAL_INODE_MASTERINFO: Inode = MAX_REGULAR_INODE + 1;
pub const SPECIAL_INODE_STATS: Inode = MAX_REGULAR_INODE + 2;
pub const SPECIAL_INODE_TWEAKS: Inode = MAX_REGULAR_INODE + 3;
pub const SPECIAL_INODE_OPLOG: Inode = MAX_REGULAR_INODE + 4;
pub const SPECIAL_INODE_OPHISTORY: Inode = MAX_REGULAR_INODE + 5;
pub const SPECIAL_INODE_FILE_BY_INODE: Inode = MAX_REGULAR_INODE + 6;
pub const SPECIAL_INODE_META_TRASH: Inode = MAX_REGULAR_INODE + 7;
pub const SPECIAL_INODE_META_RESERVED: Inode = MAX_REGULAR_INODE + 8;
pub const SPECIAL_INODE_META_UNDEL: Inode = MAX_REGULAR_INODE + 9;

/// Resolve a special file name looked up in the root directory.
pub fn special_inode_by_name(name: &str) -> Option<Inode> {
    match name {
        ".masterinfo" => Some(SPECIAL_INODE_MASTERINFO),
        ".stats" => Some(SPECIAL_INODE_STATS),
        ".tweaks" => Some(SPECIAL_INODE_TWEAKS),
        ".oplog" => Some(SPECIAL_INODE_OPLOG),
        ".ophistory" => Some(SPECIAL_INODE_OPHISTORY),
        ".file_by_inode" => Some(SPECIAL_INODE_FILE_BY_INODE),
        _ => None,
    }
}

pub fn is_special_inode(inode: Inode) -> bool {
    inode > MAX_REGULAR_INODE
}

/// File attributes as the master serializes them - an opaque 35 byte record
/// (type, mode, uid, gid, timestamps, nlink, length). The client caches and
/// forwards it without interpreting most fields.
pub type Attributes = [u8; 35];

/// A chunkserver endpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NetworkAddress {
    pub ip: u32,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            (self.ip >> 24) & 0xff,
            (self.ip >> 16) & 0xff,
            (self.ip >> 8) & 0xff,
            self.ip & 0xff,
            self.port
        )
    }
}

bitflags! {
    /// Session flags granted by the master during registration.
    pub struct SessionFlags: u8 {
        const READ_ONLY           = 0x01;
        const DYNAMIC_IP          = 0x02;
        const IGNORE_GID          = 0x04;
        const ALL_CAN_CHANGE_QUOTA = 0x08;
        const MAP_ALL             = 0x10;
        const NO_MASTER_PERM_CHECK = 0x20;
        const NONROOT_META        = 0x40;
    }
}

/// Kind of ACL attached to an inode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AclType {
    Access,
    Default,
}

/// Status codes used by the master and the chunkservers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Eperm = 1,
    Enotdir = 2,
    Enoent = 3,
    Eacces = 4,
    Eexist = 5,
    Einval = 6,
    Enotempty = 7,
    ChunkLost = 8,
    OutOfMemory = 9,
    IndexTooBig = 10,
    Locked = 11,
    NoChunkservers = 12,
    NoChunk = 13,
    ChunkBusy = 14,
    Eio = 17,
    Enospc = 24,
    Enametoolong = 33,
    Efbig = 34,
    Enoattr = 39,
    Enotsup = 40,
    Enodata = 41,
    WrongLockId = 45,
    NotPossible = 46,
    GroupNotRegistered = 48,
    Eintr = 49,
}

/// Number of bytes of a given chunk a read request may still cover, i.e.
/// the chunk-relative length limit imposed by the file length.
pub fn bytes_in_chunk(file_length: u64, chunk_index: u32) -> u32 {
    let chunk_start = chunk_index as u64 * CHUNK_SIZE as u64;
    if file_length <= chunk_start {
        0
    } else {
        std::cmp::min(file_length - chunk_start, CHUNK_SIZE as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_names_resolve_above_regular_range() {
        let ino = special_inode_by_name(".masterinfo").unwrap();
        assert!(is_special_inode(ino));
        assert!(!is_special_inode(ROOT_INODE));
        assert_eq!(special_inode_by_name("regular.txt"), None);
    }

    #[test]
    fn chunk_byte_limits() {
        assert_eq!(bytes_in_chunk(0, 0), 0);
        assert_eq!(bytes_in_chunk(1, 0), 1);
        assert_eq!(bytes_in_chunk(CHUNK_SIZE as u64 + 5, 0), CHUNK_SIZE);
        assert_eq!(bytes_in_chunk(CHUNK_SIZE as u64 + 5, 1), 5);
        assert_eq!(bytes_in_chunk(CHUNK_SIZE as u64, 1), 0);
    }
}
