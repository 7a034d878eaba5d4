//! Thin façade over in-process or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **waitable** but non-blocking — the exchange and
//! collective paths call `.wait()` (or `.wait_timeout()`) before they trust
//! that a buffer is ready. The handle is constructed once per process and
//! passed explicitly to every operation; there is no hidden global state
//! beyond the in-process mailbox backing [`RayonComm`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::indexing::Dir;

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync + 'static {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of this process in the group.
    fn rank(&self) -> usize;
    /// Number of processes in the group.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;

    /// Wait at most `timeout`; `None` on expiry. Backends without a
    /// watchdog fall back to a plain blocking wait.
    fn wait_timeout(self, _timeout: Duration) -> Option<Vec<u8>>
    where
        Self: Sized,
    {
        self.wait()
    }
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Typed message tag; each communication epoch claims a block of tags so
/// concurrent phases cannot collide.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    #[inline]
    pub const fn new(v: u16) -> Self {
        CommTag(v)
    }
    #[inline]
    pub const fn base(self) -> u16 {
        self.0
    }
    #[inline]
    pub const fn offset(self, off: u16) -> CommTag {
        CommTag(self.0.wrapping_add(off))
    }
}

/// Tag block for one halo-exchange epoch: one sub-tag per (axis, side),
/// where the side names the *destination* ghost slab.
#[derive(Copy, Clone, Debug)]
pub struct ExchangeTags {
    base: CommTag,
}

impl ExchangeTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self { base }
    }
    #[inline]
    pub fn slab(self, axis: usize, dir: Dir) -> u16 {
        self.base.offset((axis as u16) * 2 + dir.index() as u16).base()
    }
}

/// Tag pair for gather/assembly: extent header, then payload.
#[derive(Copy, Clone, Debug)]
pub struct AssemblyTags {
    pub header: CommTag,
    pub data: CommTag,
}

impl AssemblyTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            header: base,
            data: base.offset(1),
        }
    }
}

/// Tag pair for global reductions: partials in, result out.
#[derive(Copy, Clone, Debug)]
pub struct ReduceTags {
    pub partial: CommTag,
    pub result: CommTag,
}

impl ReduceTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            partial: base,
            result: base.offset(1),
        }
    }
}

/// Tag triple for element-wise replica fusion.
#[derive(Copy, Clone, Debug)]
pub struct ReplicaTags {
    pub count: CommTag,
    pub data: CommTag,
    pub result: CommTag,
}

impl ReplicaTags {
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            count: base,
            data: base.offset(1),
            result: base.offset(2),
        }
    }
}

pub const DEFAULT_EXCHANGE_TAG: CommTag = CommTag::new(0x4800);
pub const DEFAULT_ASSEMBLY_TAG: CommTag = CommTag::new(0x4900);
pub const DEFAULT_REDUCE_TAG: CommTag = CommTag::new(0x4A00);
pub const DEFAULT_REPLICA_TAG: CommTag = CommTag::new(0x4B00);

/// Compile-time no-op comm for pure serial use: one rank, no peers.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
}

// --- RayonComm: intra-process / multi-thread -----------------------------

type Key = (usize, usize, u16); // (src, dst, tag)

/// Process-wide mailbox; FIFO per (src, dst, tag) channel. Tests that use
/// [`RayonComm`] share this and must not run concurrently with unrelated
/// ranks reusing the same tags (see `serial_test` in the test suite).
static MAILBOX: Lazy<DashMap<Key, VecDeque<Bytes>>> = Lazy::new(DashMap::new);

/// Receive handle backed by a polling thread.
pub struct LocalHandle {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.slot.lock().take()
    }

    fn wait_timeout(mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(data) = self.slot.lock().take() {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                return Some(data);
            }
            if Instant::now() >= deadline {
                self.cancel.store(true, Relaxed);
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                // the poller may have delivered just before it saw the flag
                return self.slot.lock().take();
            }
            std::thread::yield_now();
        }
    }
}

/// In-process communicator: every simulated rank owns one instance, all
/// instances share the mailbox.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        MAILBOX
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (peer, self.rank, tag);
        let slot = Arc::new(Mutex::new(None));
        let cancel = Arc::new(AtomicBool::new(false));
        let slot2 = Arc::clone(&slot);
        let cancel2 = Arc::clone(&cancel);
        let cap = buf.len();
        let handle = std::thread::spawn(move || {
            loop {
                let popped = MAILBOX.get_mut(&key).and_then(|mut q| q.pop_front());
                if let Some(bytes) = popped {
                    // messages longer than the posted buffer are truncated
                    let n = cap.min(bytes.len());
                    *slot2.lock() = Some(bytes[..n].to_vec());
                    return;
                }
                if cancel2.load(Relaxed) {
                    return;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            slot,
            cancel,
            handle: Some(handle),
        }
    }
}

// --- MPI backend (feature = "mpi-support") -------------------------------

#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    pub struct MpiComm {
        _universe: mpi::environment::Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    // The caller is responsible for an MPI_THREAD level matching how the
    // handle is shared; the handle itself holds no interior mutability.
    unsafe impl Send for MpiComm {}
    unsafe impl Sync for MpiComm {}

    impl MpiComm {
        pub fn new() -> Self {
            let universe = mpi::initialize().expect("MPI already initialized");
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Self {
                _universe: universe,
                world,
                rank,
                size,
            }
        }
    }

    /// Request plus the leaked buffer it reads from; reclaimed on wait.
    pub struct MpiSendHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    unsafe impl Send for MpiSendHandle {}

    impl Wait for MpiSendHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            drop(unsafe { Box::from_raw(self.buf) });
            None
        }
    }

    /// Request plus the leaked buffer it writes into; reclaimed on wait.
    pub struct MpiRecvHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: *mut [u8],
    }

    unsafe impl Send for MpiRecvHandle {}

    impl Wait for MpiRecvHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.req.wait();
            let data = unsafe { Box::from_raw(self.buf) };
            Some(data.into_vec())
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let leaked: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let ptr = leaked as *mut [u8];
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, &*leaked, tag as i32);
            MpiSendHandle { req, buf: ptr }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            let leaked: &'static mut [u8] = Box::leak(vec![0u8; buf.len()].into_boxed_slice());
            let ptr = leaked as *mut [u8];
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, leaked, tag as i32);
            MpiRecvHandle { req, buf: ptr }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
