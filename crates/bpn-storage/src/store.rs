//! The bundle store: push/pop/read/remove sessions over segment chains,
//! plus the crash-restart restore scan.
//!
//! A chain moves through `allocated → writing → cataloged → reading →
//! removed`. Pushes reserve a whole chain up front, stream one segment per
//! call through the disk rings, and catalog the chain when the last segment
//! is committed. Pops detach the best chain per priority/expiration order,
//! read it back with bounded read-ahead, and finally erase the head segment
//! and free the chain.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use bpn_core::PrimaryFields;

use crate::catalog::{Catalog, ChainInfo, PoppedChain};
use crate::error::StorageError;
use crate::io_worker::{DiskChannel, DiskIoWorker, MainNotifier, ReadDestination, SegmentOp};
use crate::memory_manager::MemoryManager;
use crate::ring::DEFAULT_RING_DEPTH;
use crate::segment::{
    segments_required, SegmentHeader, SegmentId, NEXT_SEGMENT_NONE, PER_SEGMENT_PAYLOAD,
    SEGMENT_RESERVED_SPACE, SEGMENT_SIZE, SIZE_NON_HEAD,
};

/// Read-ahead depth of one reading session.
pub const READ_CACHE_NUM_SEGMENTS_PER_SESSION: usize = 32;

/// Store construction parameters.
#[derive(Debug, Clone)]
#[must_use]
pub struct StoreOptions {
    /// One store file per disk; the segment address space is striped across
    /// them by `segment_id % num_disks`.
    pub store_file_paths: Vec<PathBuf>,
    pub total_capacity_bytes: u64,
    pub try_restore_from_disk: bool,
    pub auto_delete_files_on_exit: bool,
    pub ring_depth: u32,
}

impl StoreOptions {
    pub fn new(store_file_paths: Vec<PathBuf>, total_capacity_bytes: u64) -> Self {
        StoreOptions {
            store_file_paths,
            total_capacity_bytes,
            try_restore_from_disk: false,
            auto_delete_files_on_exit: false,
            ring_depth: DEFAULT_RING_DEPTH,
        }
    }
}

/// State of one bundle being written to disk.
#[derive(Debug, Default)]
#[must_use]
pub struct WriteSession {
    chain: ChainInfo,
    next_logical_segment: usize,
    dest_node: u64,
    priority_index: u8,
    abs_expiration: u64,
}

impl WriteSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segment IDs reserved for this session's chain.
    #[must_use]
    pub fn segment_chain(&self) -> &[SegmentId] {
        &self.chain.segment_chain
    }
}

/// State of one bundle being read back from disk.
#[derive(Debug, Default)]
#[must_use]
pub struct ReadSession {
    popped: Option<PoppedChain>,
    next_logical_segment: usize,
    next_logical_segment_to_cache: usize,
    read_cache: VecDeque<(SegmentId, Arc<ReadDestination>)>,
}

impl ReadSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the popped bundle, if one is held.
    #[must_use]
    pub fn bundle_size(&self) -> Option<u64> {
        self.popped.as_ref().map(|p| p.chain.bundle_size_bytes)
    }

    /// Segment IDs of the popped chain.
    #[must_use]
    pub fn segment_chain(&self) -> &[SegmentId] {
        self.popped
            .as_ref()
            .map(|p| p.chain.segment_chain.as_slice())
            .unwrap_or(&[])
    }

    fn reset_cursor(&mut self) {
        self.next_logical_segment = 0;
        self.next_logical_segment_to_cache = 0;
        self.read_cache.clear();
    }
}

/// Read-only snapshot of the store's operational counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct StoreCounters {
    pub num_bundles_stored: u64,
    pub num_bundles_sent_to_egress: u64,
    pub num_bundles_deleted_from_storage: u64,
    pub num_bundles_restored: u64,
    pub num_bytes_restored: u64,
    pub num_segments_restored: u64,
}

/// The multi-disk segmented bundle store.
#[derive(Debug)]
#[must_use]
pub struct BundleStore {
    memory_manager: MemoryManager,
    catalog: Mutex<Catalog>,
    channels: Vec<Arc<DiskChannel>>,
    workers: Vec<DiskIoWorker>,
    main: Arc<MainNotifier>,
    file_paths: Vec<PathBuf>,
    num_disks: usize,
    auto_delete_files_on_exit: bool,
    bundles_stored: AtomicU64,
    bundles_sent_to_egress: AtomicU64,
    bundles_deleted: AtomicU64,
    bundles_restored: u64,
    bytes_restored: u64,
    segments_restored: u64,
}

impl BundleStore {
    /// Open (and if configured, restore) a store, then start the disk workers.
    pub fn new(options: StoreOptions) -> Result<Self, StorageError> {
        if options.store_file_paths.is_empty() {
            return Err(StorageError::SessionInvalid("no store files configured"));
        }
        let num_disks = options.store_file_paths.len();
        let max_segments =
            u32::try_from(options.total_capacity_bytes / SEGMENT_SIZE as u64).unwrap_or(u32::MAX);
        let memory_manager = MemoryManager::new(max_segments);
        let mut catalog = Catalog::new();

        // restore runs single-threaded against its own handles, before any
        // worker starts
        let mut restored = (0u64, 0u64, 0u64);
        if options.try_restore_from_disk {
            if options.store_file_paths.iter().all(|p| p.exists()) {
                restored = restore_from_disk(
                    &options.store_file_paths,
                    &memory_manager,
                    &mut catalog,
                )?;
                info!(
                    bundles = restored.0,
                    bytes = restored.1,
                    segments = restored.2,
                    "restored bundle store from disk"
                );
            } else {
                warn!("restore requested but store files do not exist; starting empty");
            }
        }

        let main = Arc::new(MainNotifier::default());
        let mut channels = Vec::with_capacity(num_disks);
        let mut workers = Vec::with_capacity(num_disks);
        for (disk_index, path) in options.store_file_paths.iter().enumerate() {
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            let channel = Arc::new(DiskChannel::new(options.ring_depth, Arc::clone(&main)));
            workers.push(DiskIoWorker::spawn(
                disk_index,
                num_disks,
                file,
                Arc::clone(&channel),
            ));
            channels.push(channel);
        }

        Ok(BundleStore {
            memory_manager,
            catalog: Mutex::new(catalog),
            channels,
            workers,
            main,
            file_paths: options.store_file_paths,
            num_disks,
            auto_delete_files_on_exit: options.auto_delete_files_on_exit,
            bundles_stored: AtomicU64::new(0),
            bundles_sent_to_egress: AtomicU64::new(0),
            bundles_deleted: AtomicU64::new(0),
            bundles_restored: restored.0,
            bytes_restored: restored.1,
            segments_restored: restored.2,
        })
    }

    /// Begin a write session: reserve the chain for a bundle of
    /// `bundle_size_bytes` headed for `fields.destination`.
    ///
    /// Returns the number of segments the caller must push.
    pub fn push(
        &self,
        session: &mut WriteSession,
        fields: &PrimaryFields,
        bundle_size_bytes: u64,
    ) -> Result<u64, StorageError> {
        let total_segments_required = segments_required(bundle_size_bytes);
        if total_segments_required == 0 {
            return Err(StorageError::SessionInvalid("zero-size bundle"));
        }
        let segment_chain = self
            .memory_manager
            .allocate_segments(total_segments_required)?;
        session.chain = ChainInfo {
            bundle_size_bytes,
            segment_chain,
        };
        session.next_logical_segment = 0;
        session.dest_node = fields.destination.node;
        session.priority_index = fields.priority_index;
        session.abs_expiration = fields.abs_expiration_secs;
        Ok(total_segments_required)
    }

    /// Write the next segment of the session's bundle.
    ///
    /// `buf` carries up to [`PER_SEGMENT_PAYLOAD`] payload bytes. On the
    /// final segment the chain is inserted at the front of its catalog
    /// bucket.
    pub fn push_segment(&self, session: &mut WriteSession, buf: &[u8]) -> Result<(), StorageError> {
        let chain_len = session.chain.segment_chain.len();
        if session.next_logical_segment >= chain_len {
            return Err(StorageError::SessionInvalid("all segments already pushed"));
        }
        if buf.len() > PER_SEGMENT_PAYLOAD {
            return Err(StorageError::SessionInvalid("segment payload too large"));
        }
        let bundle_size_bytes = if session.next_logical_segment == 0 {
            session.chain.bundle_size_bytes
        } else {
            SIZE_NON_HEAD
        };
        let segment_id = session.chain.segment_chain[session.next_logical_segment];
        session.next_logical_segment += 1;
        let next_segment_id = if session.next_logical_segment == chain_len {
            NEXT_SEGMENT_NONE
        } else {
            session.chain.segment_chain[session.next_logical_segment]
        };

        let mut data = vec![0u8; SEGMENT_SIZE];
        SegmentHeader {
            bundle_size_bytes,
            next_segment_id,
        }
        .write_to(&mut data);
        data[SEGMENT_RESERVED_SPACE..SEGMENT_RESERVED_SPACE + buf.len()].copy_from_slice(buf);

        let disk = self.disk_of(segment_id);
        self.channels[disk].submit_blocking(segment_id, SegmentOp::Write { data })?;
        if self.channels[disk].has_write_failure() {
            return Err(StorageError::SegmentWriteFailed { segment_id, disk });
        }

        if session.next_logical_segment == chain_len {
            let chain = std::mem::take(&mut session.chain);
            self.catalog
                .lock()
                .expect("catalog mutex poisoned")
                .insert_front(
                    session.dest_node,
                    session.priority_index,
                    session.abs_expiration,
                    chain,
                );
            self.bundles_stored.fetch_add(1, Ordering::Relaxed);
            debug!(dest_node = session.dest_node, "bundle cataloged");
        }
        Ok(())
    }

    /// Push an entire bundle through one write session.
    pub fn push_all_segments(
        &self,
        session: &mut WriteSession,
        bundle: &[u8],
    ) -> Result<(), StorageError> {
        let mut pushed = 0usize;
        while pushed < bundle.len() {
            let end = (pushed + PER_SEGMENT_PAYLOAD).min(bundle.len());
            self.push_segment(session, &bundle[pushed..end])?;
            pushed = end;
        }
        Ok(())
    }

    /// Abort a write session, returning its reserved segments to the pool.
    ///
    /// Required after a push error so in-flight chains are not leaked. If
    /// the head segment already reached its ring, it is overwritten with
    /// the non-head sentinel so a later restore scan skips the dead chain.
    pub fn abort_write(&self, session: &mut WriteSession) -> Result<(), StorageError> {
        let pushed_segments = session.next_logical_segment;
        session.next_logical_segment = 0;
        let chain = std::mem::take(&mut session.chain);
        if chain.segment_chain.is_empty() {
            return Ok(());
        }
        if pushed_segments > 0 {
            let head_id = chain.segment_chain[0];
            self.channels[self.disk_of(head_id)].submit_blocking(
                head_id,
                SegmentOp::Write {
                    data: SIZE_NON_HEAD.to_le_bytes().to_vec(),
                },
            )?;
        }
        self.memory_manager.free_segments(&chain.segment_chain)
    }

    /// Detach the best stored bundle among `available_dest_nodes`.
    ///
    /// Returns the bundle size, or `None` if nothing is stored for those
    /// destinations. The session takes custody of the chain until
    /// [`Self::return_top`] or [`Self::remove_read_bundle_from_disk`].
    pub fn pop_top(
        &self,
        session: &mut ReadSession,
        available_dest_nodes: &[u64],
    ) -> Result<Option<u64>, StorageError> {
        if session.popped.is_some() {
            return Err(StorageError::SessionInvalid(
                "session already holds a chain",
            ));
        }
        session.reset_cursor();
        let popped = self
            .catalog
            .lock()
            .expect("catalog mutex poisoned")
            .pop_front(available_dest_nodes);
        match popped {
            Some(popped) => {
                let size = popped.chain.bundle_size_bytes;
                session.popped = Some(popped);
                self.bundles_sent_to_egress.fetch_add(1, Ordering::Relaxed);
                Ok(Some(size))
            }
            None => Ok(None),
        }
    }

    /// Re-insert the session's chain at the front of its expiration bucket
    /// (transmission failed without consuming custody).
    pub fn return_top(&self, session: &mut ReadSession) -> Result<(), StorageError> {
        let popped = session
            .popped
            .take()
            .ok_or(StorageError::SessionInvalid("no chain to return"))?;
        session.reset_cursor();
        self.catalog
            .lock()
            .expect("catalog mutex poisoned")
            .return_front(popped);
        self.bundles_sent_to_egress.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Read the next segment's payload of the popped bundle.
    ///
    /// Schedules up to [`READ_CACHE_NUM_SEGMENTS_PER_SESSION`] read-ahead
    /// segments, blocks until the next completion, and validates the stored
    /// header against the in-memory chain.
    pub fn top_segment(&self, session: &mut ReadSession) -> Result<Vec<u8>, StorageError> {
        let popped = session
            .popped
            .as_ref()
            .ok_or(StorageError::SessionInvalid("no chain popped"))?;
        let chain = &popped.chain;
        let chain_len = chain.segment_chain.len();
        if session.next_logical_segment >= chain_len {
            return Err(StorageError::SessionInvalid("bundle fully read"));
        }

        // schedule read-ahead
        while session.next_logical_segment_to_cache - session.next_logical_segment
            < READ_CACHE_NUM_SEGMENTS_PER_SESSION
            && session.next_logical_segment_to_cache < chain_len
        {
            let segment_id = chain.segment_chain[session.next_logical_segment_to_cache];
            session.next_logical_segment_to_cache += 1;
            let dest = ReadDestination::new();
            session.read_cache.push_back((segment_id, Arc::clone(&dest)));
            let disk = self.disk_of(segment_id);
            self.channels[disk].submit_blocking(segment_id, SegmentOp::Read { dest })?;
        }

        let (segment_id, dest) = session
            .read_cache
            .pop_front()
            .expect("read-ahead scheduled at least one segment");
        while !dest.is_completed() {
            self.main.wait_briefly();
        }
        if dest.is_failed() {
            return Err(StorageError::SegmentReadFailed { segment_id });
        }
        let data = dest.take_data();
        let header = SegmentHeader::read_from(&data);

        // validate sentinels and linkage against the in-memory chain
        let logical = session.next_logical_segment;
        if logical == 0 {
            if header.bundle_size_bytes != chain.bundle_size_bytes {
                return Err(StorageError::ChainLinkageInconsistent(format!(
                    "head segment size {} does not match chain size {}",
                    header.bundle_size_bytes, chain.bundle_size_bytes
                )));
            }
        } else if header.bundle_size_bytes != SIZE_NON_HEAD {
            return Err(StorageError::ChainLinkageInconsistent(format!(
                "non-head segment {} carries size {}",
                segment_id, header.bundle_size_bytes
            )));
        }
        session.next_logical_segment += 1;
        if session.next_logical_segment < chain_len {
            let expected = chain.segment_chain[session.next_logical_segment];
            if header.next_segment_id != expected {
                return Err(StorageError::ChainLinkageInconsistent(format!(
                    "next segment id {} does not match chain entry {expected}",
                    header.next_segment_id
                )));
            }
        } else if header.next_segment_id != NEXT_SEGMENT_NONE {
            return Err(StorageError::ChainLinkageInconsistent(format!(
                "last segment links to {}",
                header.next_segment_id
            )));
        }

        let is_last = session.next_logical_segment == chain_len;
        let payload_len = if is_last {
            let rem = (chain.bundle_size_bytes % PER_SEGMENT_PAYLOAD as u64) as usize;
            if rem == 0 {
                PER_SEGMENT_PAYLOAD
            } else {
                rem
            }
        } else {
            PER_SEGMENT_PAYLOAD
        };
        Ok(data[SEGMENT_RESERVED_SPACE..SEGMENT_RESERVED_SPACE + payload_len].to_vec())
    }

    /// Read the whole popped bundle back.
    pub fn read_all(&self, session: &mut ReadSession) -> Result<Vec<u8>, StorageError> {
        let size = session
            .bundle_size()
            .ok_or(StorageError::SessionInvalid("no chain popped"))?;
        let mut out = Vec::with_capacity(size as usize);
        while (session.next_logical_segment as u64)
            < segments_required(size)
        {
            out.extend_from_slice(&self.top_segment(session)?);
        }
        Ok(out)
    }

    /// Erase the chain's head on disk and free its segments.
    ///
    /// Fails with [`StorageError::BundleNotRead`] if the read is incomplete
    /// and `force` is false. The head erase writes the non-head size
    /// sentinel so the restore scan skips the dead chain.
    pub fn remove_read_bundle_from_disk(
        &self,
        session: &mut ReadSession,
        force: bool,
    ) -> Result<(), StorageError> {
        let popped = session
            .popped
            .as_ref()
            .ok_or(StorageError::SessionInvalid("no chain popped"))?;
        if !force && session.next_logical_segment != popped.chain.segment_chain.len() {
            return Err(StorageError::BundleNotRead);
        }
        let head_id = popped.chain.segment_chain[0];
        let disk = self.disk_of(head_id);
        self.channels[disk].submit_blocking(
            head_id,
            SegmentOp::Write {
                data: SIZE_NON_HEAD.to_le_bytes().to_vec(),
            },
        )?;
        let popped = session.popped.take().expect("chain checked above");
        session.reset_cursor();
        self.memory_manager
            .free_segments(&popped.chain.segment_chain)?;
        self.bundles_deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The segment allocator (exposed for restore verification and tests).
    #[must_use]
    pub fn memory_manager(&self) -> &MemoryManager {
        &self.memory_manager
    }

    /// Number of chains currently cataloged.
    #[must_use]
    pub fn num_bundles_cataloged(&self) -> u64 {
        self.catalog
            .lock()
            .expect("catalog mutex poisoned")
            .num_chains()
    }

    /// Snapshot of the operational counters exposed to telemetry.
    #[must_use]
    pub fn counters(&self) -> StoreCounters {
        StoreCounters {
            num_bundles_stored: self.bundles_stored.load(Ordering::Relaxed),
            num_bundles_sent_to_egress: self.bundles_sent_to_egress.load(Ordering::Relaxed),
            num_bundles_deleted_from_storage: self.bundles_deleted.load(Ordering::Relaxed),
            num_bundles_restored: self.bundles_restored,
            num_bytes_restored: self.bytes_restored,
            num_segments_restored: self.segments_restored,
        }
    }

    fn disk_of(&self, segment_id: SegmentId) -> usize {
        (segment_id as usize) % self.num_disks
    }
}

impl Drop for BundleStore {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.shutdown_and_join();
        }
        if self.auto_delete_files_on_exit {
            for path in &self.file_paths {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("could not delete store file {}: {e}", path.display());
                } else {
                    info!("deleted store file {}", path.display());
                }
            }
        }
    }
}

/// Scan on-disk segment headers and rebuild allocator and catalog state.
///
/// Returns `(bundles, bytes, segments)` restored. Any linkage inconsistency
/// is fatal.
fn restore_from_disk(
    paths: &[PathBuf],
    memory_manager: &MemoryManager,
    catalog: &mut Catalog,
) -> Result<(u64, u64, u64), StorageError> {
    let num_disks = paths.len();
    let mut files = Vec::with_capacity(num_disks);
    let mut file_sizes = Vec::with_capacity(num_disks);
    for path in paths {
        let file = File::open(path)?;
        file_sizes.push(file.metadata()?.len());
        files.push(file);
    }

    let mut total_bundles = 0u64;
    let mut total_bytes = 0u64;
    let mut total_segments = 0u64;
    let mut buf = vec![0u8; SEGMENT_SIZE];

    'scan: for potential_head in 0..memory_manager.max_segments() {
        if !memory_manager.is_segment_free(potential_head) {
            continue;
        }
        let mut segment_id = potential_head;
        let mut chain = ChainInfo::default();
        let mut fields: Option<PrimaryFields> = None;
        let mut total_segments_required = 0u64;

        for next_logical in 0u64.. {
            let disk = (segment_id as usize) % num_disks;
            let offset = (segment_id as u64 / num_disks as u64) * SEGMENT_SIZE as u64;
            if next_logical == 0 && offset + SEGMENT_SIZE as u64 > file_sizes[disk] {
                debug!(potential_head, "end of restore scan");
                break 'scan;
            }
            let file = &mut files[disk];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf).map_err(|e| {
                StorageError::RestoreFailed(format!(
                    "read of segment {segment_id} at offset {offset} failed: {e}"
                ))
            })?;
            let header = SegmentHeader::read_from(&buf);

            if next_logical == 0 {
                if header.bundle_size_bytes == SIZE_NON_HEAD {
                    break; // not a head segment
                }
                let payload = &buf[SEGMENT_RESERVED_SPACE..];
                match PrimaryFields::decode(payload) {
                    Ok(decoded) => fields = Some(decoded),
                    Err(_) if header.bundle_size_bytes == 0 => {
                        // a never-written all-zero segment, not a real head
                        break;
                    }
                    Err(e) => {
                        return Err(StorageError::RestoreFailed(format!(
                            "head segment {segment_id} holds a malformed bundle: {e}"
                        )));
                    }
                }
                total_segments_required = segments_required(header.bundle_size_bytes).max(1);
                chain.bundle_size_bytes = header.bundle_size_bytes;
                chain.segment_chain.reserve(total_segments_required as usize);
                total_bytes += header.bundle_size_bytes;
                total_segments += total_segments_required;
            } else if header.bundle_size_bytes != SIZE_NON_HEAD {
                return Err(StorageError::ChainLinkageInconsistent(format!(
                    "non-head segment {segment_id} carries size {}",
                    header.bundle_size_bytes
                )));
            }

            if next_logical >= total_segments_required {
                return Err(StorageError::ChainLinkageInconsistent(
                    "logical segment exceeds total segments required".into(),
                ));
            }
            if !memory_manager.is_segment_free(segment_id) {
                return Err(StorageError::RestoreFailed(format!(
                    "segment {segment_id} is already allocated"
                )));
            }
            memory_manager.allocate_specific(segment_id);
            chain.segment_chain.push(segment_id);

            if next_logical + 1 == total_segments_required {
                if header.next_segment_id != NEXT_SEGMENT_NONE {
                    return Err(StorageError::ChainLinkageInconsistent(
                        "last logical segment links to a successor".into(),
                    ));
                }
                let fields = fields.expect("head fields decoded on first segment");
                catalog.insert_front(
                    fields.destination.node,
                    fields.priority_index,
                    fields.abs_expiration_secs,
                    chain,
                );
                total_bundles += 1;
                break;
            }
            if header.next_segment_id == NEXT_SEGMENT_NONE {
                return Err(StorageError::ChainLinkageInconsistent(
                    "chain ends before all segments were seen".into(),
                ));
            }
            segment_id = header.next_segment_id;
        }
    }

    Ok((total_bundles, total_bytes, total_segments))
}
