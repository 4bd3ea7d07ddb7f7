//! Request and response shapes of the master protocol.
//!
//! One variant per RPC; the transport is responsible for the wire encoding.
//! Every response carries a status on the wire - the transport maps non-ok
//! statuses to errors, so the variants here only model success payloads.

use crate::common::chunk_part::ChunkPartType;
use crate::protocol::{AclType, Attributes, Inode, NetworkAddress, SessionFlags};

/// One replica or part location.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PartLocation {
    pub address: NetworkAddress,
    pub part_type: ChunkPartType,
}

/// Simplified POSIX ACL or rich ACL carried over the wire.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Acl {
    pub owner_mask: u16,
    pub group_mask: u16,
    pub other_mask: u16,
    pub flags: u16,
    pub entries: Vec<AclEntry>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AclEntry {
    pub kind: u8,
    pub flags: u16,
    pub mask: u16,
    pub id: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockKind {
    Shared,
    Exclusive,
    Unlock,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub index: u32,
    pub inode: Inode,
    pub name: String,
    pub attributes: Attributes,
}

#[derive(Clone, Debug)]
pub enum MasterRequest {
    // chunk resolution and write pinning
    ReadChunk { inode: Inode, chunk_index: u32 },
    WriteChunk { inode: Inode, chunk_index: u32, lock_id: Option<u32> },
    WriteChunkEnd { chunk_id: u64, lock_id: u32, inode: Inode, file_length: u64 },
    TruncateBegin { inode: Inode, opened: bool, uid: u32, gid: u32, length: u64, lock_id: Option<u32> },
    TruncateEnd { inode: Inode, uid: u32, gid: u32, length: u64, lock_id: u32 },

    // namespace
    Lookup { parent: Inode, name: String, uid: u32, gid: u32 },
    GetAttr { inode: Inode, uid: u32, gid: u32 },
    SetAttr { inode: Inode, uid: u32, gid: u32, mode_mask: u8, attributes: Attributes },
    Mkdir { parent: Inode, name: String, mode: u16, uid: u32, gid: u32 },
    Rmdir { parent: Inode, name: String, uid: u32, gid: u32 },
    Mknod { parent: Inode, name: String, mode: u16, uid: u32, gid: u32 },
    Unlink { parent: Inode, name: String, uid: u32, gid: u32 },
    Link { inode: Inode, parent: Inode, name: String, uid: u32, gid: u32 },
    Symlink { parent: Inode, name: String, target: String, uid: u32, gid: u32 },
    Readlink { inode: Inode },
    Rename { parent: Inode, name: String, new_parent: Inode, new_name: String, uid: u32, gid: u32 },
    Readdir { parent: Inode, first_index: u32, max_entries: u32, uid: u32, gid: u32 },
    Open { inode: Inode, flags: u32, uid: u32, gid: u32 },
    Release { inode: Inode },

    // acl
    GetAcl { inode: Inode, uid: u32, gid: u32, acl_type: AclType },
    SetAcl { inode: Inode, acl_type: AclType, acl: Acl },
    DeleteAcl { inode: Inode, acl_type: AclType },

    // file locks
    GetLk { inode: Inode, owner: u64, kind: LockKind, range: LockRange },
    SetLk { inode: Inode, owner: u64, req_id: u32, kind: LockKind, range: LockRange },
    Flock { inode: Inode, owner: u64, req_id: u32, kind: LockKind },
    LockInterrupt { inode: Inode, owner: u64, req_id: u32 },

    // throttling
    IoLimit { config_version: u32, group: String, bytes: u64 },

    // session
    GetRandom,
    NewSession { challenge_response: [u8; 32], subfolder: String, version: u32 },
    Reconnect { session_id: u64, version: u32 },
    UpdateCredentials { index: u32, gids: Vec<u32> },
}

#[derive(Clone, Debug)]
pub enum MasterResponse {
    ChunkLocation {
        file_length: u64,
        chunk_id: u64,
        version: u32,
        locations: Vec<PartLocation>,
    },
    WriteChunkGranted {
        file_length: u64,
        chunk_id: u64,
        version: u32,
        lock_id: u32,
        chain: Vec<PartLocation>,
    },
    Done,
    TruncateStarted { old_length: u64, lock_id: u32 },
    EntryAttributes { inode: Inode, attributes: Attributes },
    Attributes(Attributes),
    SymlinkTarget(String),
    Directory { entries: Vec<DirEntry>, end_of_directory: bool },
    AclData(Option<Acl>),
    LockStatus { kind: LockKind, range: LockRange, owner: u64 },
    /// Lock request queued; the grant arrives asynchronously.
    LockQueued,
    IoLimitGranted { config_version: u32, group: String, bytes: u64 },
    Challenge([u8; 32]),
    SessionEstablished { session_id: u64, flags: SessionFlags },
}
