//! Per-disk blocking I/O workers fed by SPSC rings.
//!
//! Each disk owns a ring of slots, a worker thread, and a file handle.
//! Producers fill a slot (a full-segment write, a head-erase, or a read with
//! a caller-owned destination) and signal the worker; the worker seeks to
//! `(segment_id / num_disks) * SEGMENT_SIZE` within its file and performs
//! the operation in ring order. Producers blocked on a full ring and readers
//! waiting for completions park on a shared condition variable with a 10 ms
//! timeout so shutdown polling stays responsive.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::StorageError;
use crate::ring::CircularIndexBuffer;
use crate::segment::{SegmentId, SEGMENT_SIZE};

/// Producer/completion wait quantum.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Shared wakeup for store threads blocked on full rings or pending reads.
#[derive(Debug, Default)]
pub struct MainNotifier {
    mutex: Mutex<()>,
    cv: Condvar,
}

impl MainNotifier {
    /// Park for up to one wait quantum.
    pub fn wait_briefly(&self) {
        let guard = self.mutex.lock().expect("main notifier mutex poisoned");
        let _unused = self
            .cv
            .wait_timeout(guard, WAIT_TIMEOUT)
            .expect("main notifier mutex poisoned");
    }

    pub fn notify_all(&self) {
        self.cv.notify_all();
    }
}

/// Destination of one scheduled segment read, owned by the reading session.
#[derive(Debug, Default)]
pub struct ReadDestination {
    data: Mutex<Vec<u8>>,
    completed: AtomicBool,
    failed: AtomicBool,
}

impl ReadDestination {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Take the segment bytes out of a completed read.
    #[must_use]
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock().expect("read destination mutex poisoned"))
    }
}

/// One queued segment operation.
#[derive(Debug)]
pub enum SegmentOp {
    /// Write a full segment image (or a shorter head-erase prefix).
    Write { data: Vec<u8> },
    /// Read a full segment into the caller's destination.
    Read { dest: Arc<ReadDestination> },
}

#[derive(Debug)]
struct Slot {
    segment_id: SegmentId,
    op: SegmentOp,
}

/// Shared state between one disk's producers and its worker thread.
#[derive(Debug)]
pub struct DiskChannel {
    ring: CircularIndexBuffer,
    slots: Vec<Mutex<Option<Slot>>>,
    work_mutex: Mutex<()>,
    work_cv: Condvar,
    shutdown: AtomicBool,
    write_failed: AtomicBool,
    main: Arc<MainNotifier>,
}

impl DiskChannel {
    pub fn new(ring_depth: u32, main: Arc<MainNotifier>) -> Self {
        DiskChannel {
            ring: CircularIndexBuffer::new(ring_depth),
            slots: (0..ring_depth).map(|_| Mutex::new(None)).collect(),
            work_mutex: Mutex::new(()),
            work_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            write_failed: AtomicBool::new(false),
            main,
        }
    }

    /// Queue one operation, blocking (in 10 ms waits) while the ring is full.
    pub fn submit_blocking(
        &self,
        segment_id: SegmentId,
        op: SegmentOp,
    ) -> Result<(), StorageError> {
        let mut pending = Some(Slot { segment_id, op });
        loop {
            if let Some(idx) = self.ring.get_index_for_write() {
                *self.slots[idx as usize]
                    .lock()
                    .expect("slot mutex poisoned") = pending.take();
                self.ring.commit_write();
                self.notify_worker();
                return Ok(());
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(StorageError::SessionInvalid("store is shutting down"));
            }
            // ring full: wait for the worker to drain a slot, then retry
            self.main.wait_briefly();
        }
    }

    /// Whether any write on this disk has failed since startup.
    #[must_use]
    pub fn has_write_failure(&self) -> bool {
        self.write_failed.load(Ordering::Acquire)
    }

    fn notify_worker(&self) {
        self.work_cv.notify_one();
    }

    fn wait_for_work(&self) {
        let guard = self.work_mutex.lock().expect("work mutex poisoned");
        let _unused = self
            .work_cv
            .wait_timeout(guard, WAIT_TIMEOUT)
            .expect("work mutex poisoned");
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.work_cv.notify_one();
    }
}

/// Handle to one disk's worker thread.
#[derive(Debug)]
pub struct DiskIoWorker {
    channel: Arc<DiskChannel>,
    handle: Option<JoinHandle<()>>,
}

impl DiskIoWorker {
    /// Spawn the worker thread for `disk_index` over an opened store file.
    pub fn spawn(
        disk_index: usize,
        num_disks: usize,
        file: File,
        channel: Arc<DiskChannel>,
    ) -> Self {
        let worker_channel = Arc::clone(&channel);
        let handle = std::thread::Builder::new()
            .name(format!("disk-io-{disk_index}"))
            .spawn(move || worker_loop(disk_index, num_disks, file, worker_channel))
            .expect("failed to spawn disk io worker");
        DiskIoWorker {
            channel,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<DiskChannel> {
        &self.channel
    }

    /// Signal shutdown and wait for the worker to drain its ring and exit.
    pub fn shutdown_and_join(&mut self) {
        self.channel.begin_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskIoWorker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

fn worker_loop(disk_index: usize, num_disks: usize, mut file: File, channel: Arc<DiskChannel>) {
    debug!(disk_index, "disk io worker started");
    loop {
        let Some(idx) = channel.ring.get_index_for_read() else {
            if channel.shutdown.load(Ordering::Acquire) {
                break;
            }
            channel.wait_for_work();
            continue;
        };
        let slot = channel.slots[idx as usize]
            .lock()
            .expect("slot mutex poisoned")
            .take()
            .expect("ring slot committed without contents");
        perform_op(disk_index, num_disks, &mut file, &channel, slot);
        channel.ring.commit_read();
        channel.main.notify_all();
    }
    if let Err(e) = file.sync_all() {
        error!(disk_index, "store file sync on shutdown failed: {e}");
    }
    debug!(disk_index, "disk io worker stopped");
}

fn perform_op(
    disk_index: usize,
    num_disks: usize,
    file: &mut File,
    channel: &DiskChannel,
    slot: Slot,
) {
    let offset = (slot.segment_id as u64 / num_disks as u64) * SEGMENT_SIZE as u64;
    match slot.op {
        SegmentOp::Write { data } => {
            let result = file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(&data));
            if let Err(e) = result {
                error!(
                    disk_index,
                    segment_id = slot.segment_id,
                    "segment write failed: {e}"
                );
                channel.write_failed.store(true, Ordering::Release);
            }
        }
        SegmentOp::Read { dest } => {
            let mut buf = vec![0u8; SEGMENT_SIZE];
            let result = file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.read_exact(&mut buf));
            match result {
                Ok(()) => {
                    *dest.data.lock().expect("read destination mutex poisoned") = buf;
                }
                Err(e) => {
                    error!(
                        disk_index,
                        segment_id = slot.segment_id,
                        "segment read failed: {e}"
                    );
                    dest.failed.store(true, Ordering::Release);
                }
            }
            dest.completed.store(true, Ordering::Release);
        }
    }
}
