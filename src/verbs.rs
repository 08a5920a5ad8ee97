//! RDMA capability surface consumed by the transport
//!
//! The engine never talks to hardware directly. Everything it needs from the
//! RDMA subsystem (protection domains, completion queues, queue pairs, memory
//! registration, DMA mapping and connection-manager events) goes through the
//! [`Verbs`] trait. Handles are plain integers so they can be copied into
//! work-request tags and log lines freely.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Adapter identity (node GUID)
pub type AdapterId = u64;

/// Protection domain handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdHandle(pub u32);

/// Completion queue handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqHandle(pub u32);

/// Queue pair number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpNum(pub u32);

/// Memory region handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u32);

/// Connection-manager identifier (listening or connected)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmId(pub u32);

/// Memory access flags
pub mod access {
    pub const LOCAL_WRITE: u32 = 0x1;
    pub const REMOTE_WRITE: u32 = 0x2;
    pub const REMOTE_READ: u32 = 0x4;
}

/// Errors reported by a verbs provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum VerbsError {
    #[error("no such adapter: {0:#x}")]
    NoSuchAdapter(AdapterId),

    #[error("invalid {0} handle {1}")]
    InvalidHandle(&'static str, u32),

    #[error("work queue is full")]
    QueueFull,

    #[error("work request rejected: {0}")]
    PostRejected(String),

    #[error("DMA mapping failed: {0}")]
    MappingFailed(String),

    #[error("out of memory")]
    NoMemory,

    #[error("buffer access out of bounds: offset {offset}, len {len}, capacity {capacity}")]
    OutOfBounds { offset: usize, len: usize, capacity: usize },

    #[error("address in use: {0}")]
    AddrInUse(SocketAddr),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Adapter attributes relevant to the transport
#[derive(Debug, Clone)]
pub struct DeviceAttr {
    pub node_guid: AdapterId,
    /// Scatter entries per work request
    pub max_sge: u32,
    pub max_qp_wr: u32,
    pub max_cqe: u32,
    pub num_comp_vectors: u32,
    pub max_qp_rd_atom: u8,
    pub max_qp_init_rd_atom: u8,
    /// Fast registration work requests supported
    pub mem_mgt_extensions: bool,
    pub max_fast_reg_page_list_len: u32,
}

/// Local and remote keys of a memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub handle: MrHandle,
    pub lkey: u32,
    pub rkey: u32,
}

/// DMA mapping direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Host memory read by the adapter
    ToDevice,
    /// Host memory written by the adapter
    FromDevice,
}

/// One mapped segment of a scatter-gather list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u32,
}

/// Scatter/gather entry of a work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Fast-registration request rebinding a memory region to a page list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastRegWr {
    pub mr: MrHandle,
    pub iova: u64,
    pub length: u32,
    pub page_size: u32,
    pub page_list: Vec<u64>,
    /// New key for both lkey and rkey
    pub key: u32,
    pub access: u32,
}

/// Send queue operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    RdmaWrite { remote_addr: u64, rkey: u32 },
    RdmaRead { remote_addr: u64, rkey: u32 },
    LocalInv { rkey: u32 },
    FastReg(FastRegWr),
}

/// Send work request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sg_list: Vec<Sge>,
    pub signaled: bool,
}

/// Receive work request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

/// Work completion status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalQpOperationError,
    LocalProtectionError,
    WrFlushError,
    MemoryWindowBindError,
    BadResponseError,
    LocalAccessError,
    RemoteInvalidRequestError,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceededError,
    RnrRetryExceededError,
    FatalError,
    GeneralError,
}

impl WcStatus {
    /// Discarded because the queue pair entered the error state
    pub fn is_flush(self) -> bool {
        self == WcStatus::WrFlushError
    }

    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Completion opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    LocalInv,
    FastReg,
    Recv,
}

/// Work completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    pub qp_num: QpNum,
    pub vendor_err: u32,
}

/// Queue pair creation attributes
#[derive(Debug, Clone)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    /// Signal every send (false: only requested ones)
    pub sq_sig_all: bool,
}

/// Connection acceptance parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParam {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// Connection-manager event delivered to a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    ConnectRequest {
        id: CmId,
        adapter: AdapterId,
        initiator_depth: u8,
        responder_resources: u8,
    },
    Established { id: CmId },
    Disconnected { id: CmId },
    DeviceRemoval { id: CmId },
    AddrChange { id: CmId },
    TimewaitExit { id: CmId },
    ConnectError { id: CmId },
    Rejected { id: CmId },
}

impl CmEvent {
    pub fn id(&self) -> CmId {
        match *self {
            CmEvent::ConnectRequest { id, .. }
            | CmEvent::Established { id }
            | CmEvent::Disconnected { id }
            | CmEvent::DeviceRemoval { id }
            | CmEvent::AddrChange { id }
            | CmEvent::TimewaitExit { id }
            | CmEvent::ConnectError { id }
            | CmEvent::Rejected { id } => id,
        }
    }
}

/// Completion queue notification callback
pub type CqNotifier = Arc<dyn Fn(CqHandle) + Send + Sync>;

/// Connection-manager event callback; must not block
pub type CmEventHandler = Arc<dyn Fn(CmEvent) + Send + Sync>;

/// Host memory that may be DMA mapped
///
/// Cloning shares the underlying bytes, which is how the adapter side and the
/// CPU side observe the same buffer.
#[derive(Clone, Default)]
pub struct HostBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Allocate a zeroed buffer
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        HostBuffer { inner: Arc::new(Mutex::new(data)) }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `out.len()` bytes starting at `offset`
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), VerbsError> {
        let data = self.bytes();
        let end = check_bounds(offset, out.len(), data.len())?;
        out.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    /// Copy `src` into the buffer at `offset`
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<(), VerbsError> {
        let mut data = self.bytes();
        let end = check_bounds(offset, src.len(), data.len())?;
        data[offset..end].copy_from_slice(src);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes().clone()
    }

    /// Same underlying allocation
    pub fn ptr_eq(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.inner)
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

fn check_bounds(offset: usize, len: usize, capacity: usize) -> Result<usize, VerbsError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(end),
        _ => Err(VerbsError::OutOfBounds { offset, len, capacity }),
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// RDMA verbs and connection-manager primitives
///
/// Implementations must be callable from any thread. Completion notifiers and
/// connection-manager handlers must be invoked without holding any lock the
/// provider needs for the calls the engine makes from inside them.
pub trait Verbs: Send + Sync {
    fn query_device(&self, adapter: AdapterId) -> Result<DeviceAttr, VerbsError>;

    fn alloc_pd(&self, adapter: AdapterId) -> Result<PdHandle, VerbsError>;
    fn dealloc_pd(&self, pd: PdHandle);

    /// Create a completion queue bound to a completion vector
    fn create_cq(
        &self,
        adapter: AdapterId,
        depth: u32,
        vector: u32,
        notifier: CqNotifier,
    ) -> Result<CqHandle, VerbsError>;
    fn destroy_cq(&self, cq: CqHandle);
    /// Arm the next-completion notification (edge triggered)
    fn req_notify_cq(&self, cq: CqHandle) -> Result<(), VerbsError>;
    fn poll_cq(&self, cq: CqHandle) -> Option<WorkCompletion>;

    /// Memory region covering all host memory for local access
    fn get_dma_mr(&self, pd: PdHandle, access: u32) -> Result<MrKeys, VerbsError>;
    fn alloc_fast_reg_mr(&self, pd: PdHandle, max_pages: u32) -> Result<MrKeys, VerbsError>;
    fn dereg_mr(&self, mr: MrHandle);

    fn create_qp(&self, id: CmId, pd: PdHandle, attr: &QpInitAttr) -> Result<QpNum, VerbsError>;
    fn destroy_qp(&self, qp: QpNum);
    fn post_send(&self, qp: QpNum, wrs: &[SendWr]) -> Result<(), VerbsError>;
    fn post_recv(&self, qp: QpNum, wrs: &[RecvWr]) -> Result<(), VerbsError>;

    fn dma_map_single(
        &self,
        adapter: AdapterId,
        buf: &HostBuffer,
        dir: DmaDirection,
    ) -> Result<u64, VerbsError>;
    fn dma_unmap_single(&self, adapter: AdapterId, addr: u64, len: usize, dir: DmaDirection);
    /// Map a scatter-gather list; the result may hold fewer segments than `sg`
    fn dma_map_sg(
        &self,
        adapter: AdapterId,
        sg: &[HostBuffer],
        dir: DmaDirection,
    ) -> Result<Vec<DmaSegment>, VerbsError>;
    fn dma_unmap_sg(&self, adapter: AdapterId, segments: &[DmaSegment], dir: DmaDirection);
    fn sync_for_cpu(&self, adapter: AdapterId, addr: u64, len: usize, dir: DmaDirection);
    fn sync_for_device(&self, adapter: AdapterId, addr: u64, len: usize, dir: DmaDirection);

    /// Bind and listen; events for the listener and its children go to `handler`
    fn listen(
        &self,
        addr: SocketAddr,
        backlog: u32,
        handler: CmEventHandler,
    ) -> Result<CmId, VerbsError>;
    fn accept(&self, id: CmId, param: &ConnParam) -> Result<(), VerbsError>;
    /// Move the queue pair to the error state and start the disconnect handshake
    fn disconnect(&self, id: CmId) -> Result<(), VerbsError>;
    fn destroy_id(&self, id: CmId);
    /// Local and peer addresses of a connected id
    fn route(&self, id: CmId) -> Option<(SocketAddr, SocketAddr)>;
}

// ============================================================================
// Unit Tests
// ============================================================================
