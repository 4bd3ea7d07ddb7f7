//! The filesystem client: everything the FUSE frontend calls.
//!
//! Ties the engine together: file handles with their read/write mode
//! transitions, the per-handle flush-before-read invariant, chunked
//! read/write entry points with retries, and the metadata operations with
//! their cache invalidation duties.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

use crate::cache::{AclCache, DirEntryCache, SymlinkCache};
use crate::common::chunkserver_stats::ChunkserverStats;
use crate::config::MountConfig;
use crate::cs::{ConnectionPool, CsConnector};
use crate::error::{FsError, Result};
use crate::limits::LimiterProxy;
use crate::locks::LockCoordinator;
use crate::master::messages::{Acl, DirEntry, MasterRequest, MasterResponse};
use crate::master::Master;
use crate::protocol::{
    special_inode_by_name, AclType, Attributes, Inode, CHUNK_SIZE, MAX_FILE_SIZE, NAME_MAX,
    ROOT_INODE,
};
use crate::read::{ChunkLocator, ChunkReader, ReadTimeouts, ReadaheadAdviser};
use crate::write::{self, ChunkWriter, WriteConfig};

/// Caller identity, as the kernel reports it.
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// I/O direction state of one open file.
///
/// Mixing directions is allowed on `O_RDWR` handles but a switch from
/// writing to reading must flush first, so reads observe the handle's own
/// writes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoMode {
    None,
    ReadOnly,
    WriteOnly,
    ReadMixed,
    WriteMixed,
}

pub struct FileHandle {
    inode: Inode,
    mode: IoMode,
    reader: ChunkReader,
    writer: Option<ChunkWriter>,
    readahead: ReadaheadAdviser,
    /// Set after writes changed the file; the next read re-resolves.
    force_prepare: bool,
    /// Inode invalidation epoch this handle has caught up to.
    seen_epoch: u64,
    lock_owner: Option<u64>,
}

impl FileHandle {
    pub fn mode(&self) -> IoMode {
        self.mode
    }
}

/// Per-operation invocation counters, exposed through the `.stats` special
/// file.
#[derive(Default)]
pub struct OpStats {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl OpStats {
    pub fn bump(&self, op: &'static str) {
        *self.counters.lock().entry(op).or_insert(0) += 1;
    }

    pub fn get(&self, op: &'static str) -> u64 {
        self.counters.lock().get(op).copied().unwrap_or(0)
    }

    pub fn report(&self) -> String {
        let counters = self.counters.lock();
        let mut ops: Vec<_> = counters.iter().collect();
        ops.sort();
        ops.iter().map(|(op, count)| format!("{}: {}\n", op, count)).collect()
    }
}

pub struct Client {
    master: Arc<Master>,
    locator: Arc<ChunkLocator>,
    pool: Arc<ConnectionPool>,
    stats: Arc<ChunkserverStats>,
    dir_cache: Arc<DirEntryCache>,
    attr_cache: Mutex<HashMap<Inode, (Attributes, Instant)>>,
    acl_cache: Arc<AclCache>,
    symlink_cache: Arc<SymlinkCache>,
    locks: Arc<LockCoordinator>,
    limiter: Option<Arc<LimiterProxy>>,
    config: MountConfig,
    read_timeouts: ReadTimeouts,
    write_config: WriteConfig,
    session_id: AtomicU64,
    handles: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<FileHandle>>>>,
    next_handle: AtomicU64,
    /// Bumped when an inode's content changed behind open handles
    /// (truncate); readers re-resolve their chunk locations.
    inode_epochs: Mutex<HashMap<Inode, u64>>,
    op_stats: OpStats,
}

impl Client {
    pub fn new(
        master: Arc<Master>,
        connector: Arc<dyn CsConnector>,
        config: MountConfig,
    ) -> Self {
        let locator = Arc::new(ChunkLocator::new(Arc::clone(&master)));
        let pool = Arc::new(ConnectionPool::new(
            connector,
            Duration::from_secs(config.connection_pool_ttl_s),
        ));
        let stats = Arc::new(ChunkserverStats::new());
        let dir_cache = Arc::new(DirEntryCache::new(
            Duration::from_millis(config.direntry_cache_timeout_ms),
            config.direntry_cache_size,
        ));
        let acl_cache = Arc::new(AclCache::new(config.acl_cache_size));
        let symlink_cache = Arc::new(SymlinkCache::new(
            1024,
            Duration::from_secs(config.symlink_cache_timeout_s),
        ));
        let locks = Arc::new(LockCoordinator::new(Arc::clone(&master)));
        let read_timeouts = config.read_timeouts();
        let write_config = config.write_config();
        Self {
            master,
            locator,
            pool,
            stats,
            dir_cache,
            attr_cache: Mutex::new(HashMap::new()),
            acl_cache,
            symlink_cache,
            locks,
            limiter: None,
            config,
            read_timeouts,
            write_config,
            session_id: AtomicU64::new(0),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            inode_epochs: Mutex::new(HashMap::new()),
            op_stats: OpStats::default(),
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<LimiterProxy>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn set_session_id(&self, session_id: u64) {
        self.session_id.store(session_id, Ordering::SeqCst);
    }

    pub fn op_stats(&self) -> &OpStats {
        &self.op_stats
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    fn session(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    // ---- namespace operations -------------------------------------------

    pub async fn lookup(
        &self,
        ctx: Context,
        parent: Inode,
        name: &str,
    ) -> Result<(Inode, Attributes)> {
        self.op_stats.bump("lookup");
        if name.len() > NAME_MAX {
            return Err(FsError::Enametoolong);
        }
        if parent == ROOT_INODE {
            if let Some(inode) = special_inode_by_name(name) {
                return Ok((inode, special_attributes()));
            }
        }
        if let Some(hit) = self.dir_cache.lookup(self.session(), parent, name) {
            self.op_stats.bump("lookup-cached");
            return Ok(hit);
        }
        let response = self
            .master
            .request(MasterRequest::Lookup {
                parent,
                name: name.to_string(),
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        match response {
            MasterResponse::EntryAttributes { inode, attributes } => {
                self.remember_attributes(inode, attributes);
                Ok((inode, attributes))
            }
            _ => Err(FsError::Protocol("unexpected lookup reply".into())),
        }
    }

    pub async fn getattr(&self, ctx: Context, inode: Inode) -> Result<Attributes> {
        self.op_stats.bump("getattr");
        {
            let cache = self.attr_cache.lock();
            if let Some((attributes, inserted_at)) = cache.get(&inode) {
                if inserted_at.elapsed()
                    <= Duration::from_millis(self.config.attr_cache_timeout_ms)
                {
                    return Ok(*attributes);
                }
            }
        }
        let response = self
            .master
            .request(MasterRequest::GetAttr { inode, uid: ctx.uid, gid: ctx.gid })
            .await?;
        match response {
            MasterResponse::Attributes(attributes) => {
                self.remember_attributes(inode, attributes);
                Ok(attributes)
            }
            _ => Err(FsError::Protocol("unexpected getattr reply".into())),
        }
    }

    pub async fn setattr(
        &self,
        ctx: Context,
        inode: Inode,
        mode_mask: u8,
        attributes: Attributes,
        new_mode: Option<(u16, bool)>,
    ) -> Result<Attributes> {
        self.op_stats.bump("setattr");
        let response = self
            .master
            .request(MasterRequest::SetAttr {
                inode,
                uid: ctx.uid,
                gid: ctx.gid,
                mode_mask,
                attributes,
            })
            .await?;
        let attributes = match response {
            MasterResponse::Attributes(attributes) => attributes,
            _ => return Err(FsError::Protocol("unexpected setattr reply".into())),
        };
        if let Some((mode, is_dir)) = new_mode {
            // chmod: cached ACL masks must follow the new mode bits
            self.acl_cache.set_mode(inode, mode, is_dir);
        }
        self.forget_attributes(inode);
        self.remember_attributes(inode, attributes);
        self.dir_cache.invalidate_inode(inode);
        Ok(attributes)
    }

    pub async fn mkdir(
        &self,
        ctx: Context,
        parent: Inode,
        name: &str,
        mode: u16,
    ) -> Result<(Inode, Attributes)> {
        self.op_stats.bump("mkdir");
        if name.len() > NAME_MAX {
            return Err(FsError::Enametoolong);
        }
        let response = self
            .master
            .request(MasterRequest::Mkdir {
                parent,
                name: name.to_string(),
                mode,
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        match response {
            MasterResponse::EntryAttributes { inode, attributes } => {
                self.dir_cache.invalidate_parent(parent);
                self.remember_attributes(inode, attributes);
                Ok((inode, attributes))
            }
            _ => Err(FsError::Protocol("unexpected mkdir reply".into())),
        }
    }

    pub async fn rmdir(&self, ctx: Context, parent: Inode, name: &str) -> Result<()> {
        self.op_stats.bump("rmdir");
        self.master
            .request(MasterRequest::Rmdir {
                parent,
                name: name.to_string(),
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        self.dir_cache.invalidate_parent(parent);
        Ok(())
    }

    pub async fn mknod(
        &self,
        ctx: Context,
        parent: Inode,
        name: &str,
        mode: u16,
    ) -> Result<(Inode, Attributes)> {
        self.op_stats.bump("mknod");
        if name.len() > NAME_MAX {
            return Err(FsError::Enametoolong);
        }
        let response = self
            .master
            .request(MasterRequest::Mknod {
                parent,
                name: name.to_string(),
                mode,
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        match response {
            MasterResponse::EntryAttributes { inode, attributes } => {
                self.dir_cache.invalidate_parent(parent);
                self.remember_attributes(inode, attributes);
                Ok((inode, attributes))
            }
            _ => Err(FsError::Protocol("unexpected mknod reply".into())),
        }
    }

    pub async fn unlink(&self, ctx: Context, parent: Inode, name: &str) -> Result<()> {
        self.op_stats.bump("unlink");
        // resolve first so every cache row of the victim can be dropped
        let victim = self.dir_cache.lookup(self.session(), parent, name).map(|(inode, _)| inode);
        self.master
            .request(MasterRequest::Unlink {
                parent,
                name: name.to_string(),
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        self.dir_cache.invalidate_parent(parent);
        if let Some(inode) = victim {
            self.dir_cache.invalidate_inode(inode);
            self.forget_attributes(inode);
            self.acl_cache.erase_inode(inode);
            self.symlink_cache.invalidate(inode);
        }
        Ok(())
    }

    pub async fn link(
        &self,
        ctx: Context,
        inode: Inode,
        parent: Inode,
        name: &str,
    ) -> Result<(Inode, Attributes)> {
        self.op_stats.bump("link");
        let response = self
            .master
            .request(MasterRequest::Link {
                inode,
                parent,
                name: name.to_string(),
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        match response {
            MasterResponse::EntryAttributes { inode, attributes } => {
                self.dir_cache.invalidate_parent(parent);
                self.forget_attributes(inode);
                self.remember_attributes(inode, attributes);
                Ok((inode, attributes))
            }
            _ => Err(FsError::Protocol("unexpected link reply".into())),
        }
    }

    pub async fn symlink(
        &self,
        ctx: Context,
        parent: Inode,
        name: &str,
        target: &str,
    ) -> Result<(Inode, Attributes)> {
        self.op_stats.bump("symlink");
        if name.len() > NAME_MAX {
            return Err(FsError::Enametoolong);
        }
        let response = self
            .master
            .request(MasterRequest::Symlink {
                parent,
                name: name.to_string(),
                target: target.to_string(),
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        match response {
            MasterResponse::EntryAttributes { inode, attributes } => {
                self.dir_cache.invalidate_parent(parent);
                self.symlink_cache.insert(inode, target.to_string());
                Ok((inode, attributes))
            }
            _ => Err(FsError::Protocol("unexpected symlink reply".into())),
        }
    }

    pub async fn readlink(&self, inode: Inode) -> Result<String> {
        self.op_stats.bump("readlink");
        if let Some(target) = self.symlink_cache.get(inode) {
            self.op_stats.bump("readlink-cached");
            return Ok(target);
        }
        match self.master.request(MasterRequest::Readlink { inode }).await? {
            MasterResponse::SymlinkTarget(target) => {
                self.symlink_cache.insert(inode, target.clone());
                Ok(target)
            }
            _ => Err(FsError::Protocol("unexpected readlink reply".into())),
        }
    }

    pub async fn rename(
        &self,
        ctx: Context,
        parent: Inode,
        name: &str,
        new_parent: Inode,
        new_name: &str,
    ) -> Result<()> {
        self.op_stats.bump("rename");
        if new_name.len() > NAME_MAX {
            return Err(FsError::Enametoolong);
        }
        let moved = self.dir_cache.lookup(self.session(), parent, name).map(|(inode, _)| inode);
        self.master
            .request(MasterRequest::Rename {
                parent,
                name: name.to_string(),
                new_parent,
                new_name: new_name.to_string(),
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        self.dir_cache.invalidate_parent(parent);
        self.dir_cache.invalidate_parent(new_parent);
        if let Some(inode) = moved {
            self.dir_cache.invalidate_inode(inode);
        }
        Ok(())
    }

    pub async fn readdir(
        &self,
        ctx: Context,
        parent: Inode,
        first_index: u32,
        max_entries: u32,
    ) -> Result<(Vec<DirEntry>, bool)> {
        self.op_stats.bump("readdir");
        let session = self.session();
        let (cached, end) =
            self.dir_cache.read_from(session, parent, first_index, max_entries as usize);
        if end || cached.len() >= max_entries as usize {
            self.op_stats.bump("readdir-cached");
            let entries = cached
                .into_iter()
                .map(|entry| DirEntry {
                    index: entry.index,
                    inode: entry.inode,
                    name: entry.name,
                    attributes: entry.attributes,
                })
                .collect();
            return Ok((entries, end));
        }

        let response = self
            .master
            .request(MasterRequest::Readdir {
                parent,
                first_index,
                max_entries,
                uid: ctx.uid,
                gid: ctx.gid,
            })
            .await?;
        match response {
            MasterResponse::Directory { entries, end_of_directory } => {
                let batch: Vec<(Inode, String, Attributes)> = entries
                    .iter()
                    .map(|entry| (entry.inode, entry.name.clone(), entry.attributes))
                    .collect();
                self.dir_cache.feed_batch(session, parent, first_index, &batch, end_of_directory);
                Ok((entries, end_of_directory))
            }
            _ => Err(FsError::Protocol("unexpected readdir reply".into())),
        }
    }

    // ---- acl -------------------------------------------------------------

    pub async fn get_acl(
        &self,
        ctx: Context,
        inode: Inode,
        acl_type: AclType,
    ) -> Result<Option<Acl>> {
        self.op_stats.bump("getacl");
        if let Some(cached) = self.acl_cache.get(inode, ctx.uid, ctx.gid, acl_type) {
            return Ok(cached.map(|record| (*record).clone()));
        }
        let response = self
            .master
            .request(MasterRequest::GetAcl { inode, uid: ctx.uid, gid: ctx.gid, acl_type })
            .await;
        let acl = match response {
            Ok(MasterResponse::AclData(acl)) => acl,
            Ok(_) => return Err(FsError::Protocol("unexpected getacl reply".into())),
            Err(FsError::Enoattr) => None,
            Err(err) => return Err(err),
        };
        self.acl_cache.insert(inode, ctx.uid, ctx.gid, acl_type, acl.clone());
        Ok(acl)
    }

    pub async fn set_acl(
        &self,
        _ctx: Context,
        inode: Inode,
        acl_type: AclType,
        acl: Acl,
    ) -> Result<()> {
        self.op_stats.bump("setacl");
        self.master.request(MasterRequest::SetAcl { inode, acl_type, acl }).await?;
        self.acl_cache.erase_inode(inode);
        self.forget_attributes(inode);
        Ok(())
    }

    pub async fn delete_acl(&self, _ctx: Context, inode: Inode, acl_type: AclType) -> Result<()> {
        self.op_stats.bump("deleteacl");
        self.master.request(MasterRequest::DeleteAcl { inode, acl_type }).await?;
        self.acl_cache.erase_inode(inode);
        Ok(())
    }

    // ---- open files ------------------------------------------------------

    pub async fn open(&self, ctx: Context, inode: Inode, flags: u32) -> Result<u64> {
        self.op_stats.bump("open");
        self.master
            .request(MasterRequest::Open { inode, flags, uid: ctx.uid, gid: ctx.gid })
            .await?;

        let mode = match (flags & libc::O_ACCMODE as u32) as i32 {
            libc::O_RDONLY => IoMode::ReadOnly,
            libc::O_WRONLY => IoMode::WriteOnly,
            _ => IoMode::None,
        };
        let handle = FileHandle {
            inode,
            mode,
            reader: ChunkReader::new(
                Arc::clone(&self.locator),
                Arc::clone(&self.pool),
                Arc::clone(&self.stats),
                &self.read_timeouts,
            ),
            writer: None,
            readahead: ReadaheadAdviser::with_limit(
                self.config.readahead_timeout_ms,
                self.config.readahead_window_limit,
            ),
            force_prepare: false,
            seen_epoch: self.inode_epoch(inode),
            lock_owner: None,
        };
        let handle_id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(handle_id, Arc::new(tokio::sync::Mutex::new(handle)));
        debug!("opened inode {} as handle {} ({:?})", inode, handle_id, mode);
        Ok(handle_id)
    }

    fn handle(&self, handle_id: u64) -> Result<Arc<tokio::sync::Mutex<FileHandle>>> {
        self.handles.lock().get(&handle_id).cloned().ok_or(FsError::Einval)
    }

    pub async fn handle_mode(&self, handle_id: u64) -> Result<IoMode> {
        Ok(self.handle(handle_id)?.lock().await.mode)
    }

    pub async fn read(
        &self,
        ctx: Context,
        handle_id: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>> {
        self.op_stats.bump("read");
        if let Some(limiter) = &self.limiter {
            let deadline = Instant::now() + self.read_timeouts.total;
            limiter.wait_for_read(ctx.pid, size as u64, deadline).await?;
        }

        let handle = self.handle(handle_id)?;
        let mut handle = handle.lock().await;

        match handle.mode {
            IoMode::WriteOnly => return Err(FsError::Eacces),
            IoMode::WriteMixed => {
                // drain our own writes so this read observes them
                if let Some(writer) = handle.writer.as_mut() {
                    writer.flush().await?;
                }
                handle.mode = IoMode::ReadMixed;
                handle.force_prepare = true;
            }
            IoMode::None => handle.mode = IoMode::ReadMixed,
            IoMode::ReadOnly | IoMode::ReadMixed => {}
        }

        let epoch = self.inode_epoch(handle.inode);
        if handle.seen_epoch != epoch {
            handle.seen_epoch = epoch;
            handle.force_prepare = true;
        }

        handle.readahead.feed(offset, size);
        let window = handle.readahead.window();

        let mut buffer = Vec::with_capacity(size as usize);
        let mut position = offset;
        let mut remaining = size;
        while remaining > 0 {
            let chunk_index = (position / CHUNK_SIZE as u64) as u32;
            let offset_in_chunk = (position % CHUNK_SIZE as u64) as u32;
            let piece = std::cmp::min(remaining, CHUNK_SIZE - offset_in_chunk);
            let got = self
                .read_chunk_with_retries(
                    &mut handle,
                    chunk_index,
                    offset_in_chunk,
                    piece,
                    window,
                    &mut buffer,
                )
                .await?;
            position += got as u64;
            remaining -= got;
            if got < piece {
                break; // end of file
            }
        }
        Ok(buffer)
    }

    async fn read_chunk_with_retries(
        &self,
        handle: &mut FileHandle,
        chunk_index: u32,
        offset: u32,
        size: u32,
        readahead_window: u32,
        buffer: &mut Vec<u8>,
    ) -> Result<u32> {
        let inode = handle.inode;
        let mut force = std::mem::replace(&mut handle.force_prepare, false);
        let mut attempt = 0u32;
        loop {
            handle.reader.prepare(inode, chunk_index, force).await?;
            match handle
                .reader
                .read(buffer, offset, size, &self.read_timeouts, readahead_window)
                .await
            {
                Ok(got) => return Ok(got),
                Err(err) if err.is_retryable() && attempt < self.config.io_retries => {
                    attempt += 1;
                    force = true;
                    info!(
                        "read of inode {} chunk {} failed ({}), retry {}",
                        inode, chunk_index, err, attempt
                    );
                    let backoff = std::cmp::min(100 * attempt as u64, 1000);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn write(
        &self,
        ctx: Context,
        handle_id: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        self.op_stats.bump("write");
        if offset + data.len() as u64 > MAX_FILE_SIZE {
            return Err(FsError::Efbig);
        }
        if let Some(limiter) = &self.limiter {
            let deadline = Instant::now() + self.read_timeouts.total;
            limiter.wait_for_write(ctx.pid, data.len() as u64, deadline).await?;
        }

        let handle = self.handle(handle_id)?;
        let mut handle = handle.lock().await;
        match handle.mode {
            IoMode::ReadOnly => return Err(FsError::Eacces),
            IoMode::ReadMixed | IoMode::None => handle.mode = IoMode::WriteMixed,
            IoMode::WriteOnly | IoMode::WriteMixed => {}
        }

        let inode = handle.inode;
        let mut written = 0usize;
        while written < data.len() {
            let position = offset + written as u64;
            let chunk_index = (position / CHUNK_SIZE as u64) as u32;
            let offset_in_chunk = (position % CHUNK_SIZE as u64) as u32;
            let piece =
                std::cmp::min(data.len() - written, (CHUNK_SIZE - offset_in_chunk) as usize);

            // one streaming pipeline at a time; crossing a chunk boundary
            // flushes the previous chunk
            let need_new_writer = match &handle.writer {
                Some(writer) => writer.chunk_index() != chunk_index,
                None => true,
            };
            if need_new_writer {
                if let Some(writer) = handle.writer.as_mut() {
                    writer.flush().await?;
                }
                handle.writer = Some(ChunkWriter::new(
                    Arc::clone(&self.master),
                    Arc::clone(&self.pool),
                    Arc::clone(&self.stats),
                    Arc::clone(&self.locator),
                    self.write_config,
                    inode,
                    chunk_index,
                ));
            }
            let writer = handle.writer.as_mut().expect("writer just ensured");
            writer.write(offset_in_chunk, &data[written..written + piece]).await?;
            written += piece;
        }
        Ok(written as u32)
    }

    pub async fn fsync(&self, handle_id: u64) -> Result<()> {
        self.op_stats.bump("fsync");
        let handle = self.handle(handle_id)?;
        let mut handle = handle.lock().await;
        if let Some(writer) = handle.writer.as_mut() {
            writer.flush().await?;
        }
        let inode = handle.inode;
        self.forget_attributes(inode);
        Ok(())
    }

    pub async fn flush(&self, handle_id: u64) -> Result<()> {
        self.op_stats.bump("flush");
        self.fsync(handle_id).await
    }

    /// Mark the handle as holding master-side file locks; release will
    /// clean them up last.
    pub async fn set_lock_owner(&self, handle_id: u64, owner: u64) -> Result<()> {
        let handle = self.handle(handle_id)?;
        handle.lock().await.lock_owner = Some(owner);
        Ok(())
    }

    pub async fn release(&self, ctx: Context, handle_id: u64) -> Result<()> {
        self.op_stats.bump("release");
        let _ = ctx;
        let handle = match self.handles.lock().remove(&handle_id) {
            Some(handle) => handle,
            None => return Err(FsError::Einval),
        };
        let mut handle = handle.lock().await;
        let flush_result = match handle.writer.as_mut() {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        };
        // lock release must be the last thing that happens on this file
        if let Some(owner) = handle.lock_owner.take() {
            self.locks.release_on_close(handle.inode, owner).await;
        }
        self.master.request(MasterRequest::Release { inode: handle.inode }).await?;
        self.forget_attributes(handle.inode);
        flush_result
    }

    pub async fn truncate(
        &self,
        ctx: Context,
        inode: Inode,
        opened: bool,
        length: u64,
    ) -> Result<Attributes> {
        self.op_stats.bump("truncate");
        if length > MAX_FILE_SIZE {
            return Err(FsError::Efbig);
        }
        let attributes =
            write::truncate(&self.master, inode, opened, ctx.uid, ctx.gid, length).await?;
        // every cached chunk location of this file is stale now, including
        // the ones open handles hold on to
        self.locator.invalidate_inode(inode);
        *self.inode_epochs.lock().entry(inode).or_insert(0) += 1;
        self.forget_attributes(inode);
        self.remember_attributes(inode, attributes);
        self.dir_cache.invalidate_inode(inode);
        Ok(attributes)
    }

    /// Contents of a special inode, currently just the op counters.
    pub fn read_special(&self, inode: Inode) -> Result<Vec<u8>> {
        match inode {
            crate::protocol::SPECIAL_INODE_STATS => Ok(self.op_stats.report().into_bytes()),
            _ => Err(FsError::Enotsup),
        }
    }

    fn inode_epoch(&self, inode: Inode) -> u64 {
        self.inode_epochs.lock().get(&inode).copied().unwrap_or(0)
    }

    fn remember_attributes(&self, inode: Inode, attributes: Attributes) {
        let mut cache = self.attr_cache.lock();
        if cache.len() >= 65536 {
            // crude pressure valve; entries expire fast anyway
            let ttl = Duration::from_millis(self.config.attr_cache_timeout_ms);
            cache.retain(|_, (_, inserted_at)| inserted_at.elapsed() <= ttl);
        }
        cache.insert(inode, (attributes, Instant::now()));
    }

    fn forget_attributes(&self, inode: Inode) {
        self.attr_cache.lock().remove(&inode);
    }
}

fn special_attributes() -> Attributes {
    // a read-only pseudo file
    let mut attributes = [0u8; 35];
    attributes[0] = b'f';
    attributes[1] = 0x01;
    attributes[2] = 0xa4; // 0444
    attributes
}
