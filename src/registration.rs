//! Memory registration for RDMA data transfers
//!
//! A command's scatter-gather list is made reachable by the adapter in one of
//! two ways, chosen per device:
//!
//! - **Direct DMA map**: the list is DMA mapped and referenced with the
//!   device's global DMA region key, spread over as many chained RDMA work
//!   requests as the scatter-entry limit requires.
//! - **Fast registration pool**: a pooled memory region is rebound to the
//!   list's pages with a fast-registration work request (preceded by a local
//!   invalidate when the region was registered before), so the whole transfer
//!   is a single scatter entry and a single RDMA work request.
//!
//! A transfer that falls within one DMA segment, counting from its offset,
//! or that needs more pages than one fast registration holds, uses the
//! direct path even on fast-registration devices.

use crate::config::TransportConfig;
use crate::connection::{CmdTag, WrId};
use crate::device::{Device, SgMapping};
use crate::error::{IsertError, IsertResult};
use crate::verbs::{
    access, lock, DmaDirection, DmaSegment, FastRegWr, HostBuffer, MrHandle, MrKeys, SendWr,
    Sge, Verbs, WrOpcode,
};
use std::sync::{Arc, Mutex};

/// Registration strategy of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegStrategy {
    DirectDmaMap,
    FastRegistrationPool,
}

/// Direction of an RDMA transfer, seen from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RdmaDir {
    /// Data-In: RDMA Write into the initiator's read buffer
    Write,
    /// Data-Out: RDMA Read from the initiator's write buffer
    Read,
}

impl RdmaDir {
    fn dma_direction(self) -> DmaDirection {
        match self {
            RdmaDir::Write => DmaDirection::ToDevice,
            RdmaDir::Read => DmaDirection::FromDevice,
        }
    }
}

/// What to register and where it goes
pub(crate) struct RegRequest<'a> {
    pub tag: CmdTag,
    pub sg: &'a [HostBuffer],
    pub dir: RdmaDir,
    /// Byte offset into the command's data where this transfer starts
    pub offset: u32,
    pub length: u32,
    pub remote_stag: u32,
    pub remote_va: u64,
}

/// An active registration for one RDMA operation
pub(crate) struct Registration {
    /// Registration and RDMA work requests, in post order
    pub(crate) wrs: Vec<SendWr>,
    pub(crate) length: u32,
    lease: Option<FrLease>,
    _mapping: SgMapping,
}

/// Register `req` with the device's strategy
pub(crate) fn register(
    device: &Device,
    pool: Option<&FastRegPool>,
    config: &TransportConfig,
    req: &RegRequest<'_>,
) -> IsertResult<Registration> {
    if req.length == 0 {
        return Err(IsertError::InvalidTransfer(format!(
            "zero-length transfer for {:?}",
            req.tag
        )));
    }
    let mapping = SgMapping::map(device, req.sg, req.dir.dma_direction())?;
    let pieces = slice_segments(&mapping.segments, req.offset, req.length)?;

    match (device.strategy(), pool) {
        (RegStrategy::FastRegistrationPool, Some(pool)) if pieces.len() > 1 => {
            let page_list = build_page_list(&pieces, config.page_size as u64);
            if page_list.len() > config.max_fastreg_pages {
                log::debug!(
                    "{:?}: {} pages exceed fast registration limit, mapping directly",
                    req.tag,
                    page_list.len()
                );
                return Ok(build_direct(device, mapping, &pieces, req));
            }
            build_fast_reg(pool, config, mapping, &pieces, page_list, req)
        }
        _ => Ok(build_direct(device, mapping, &pieces, req)),
    }
}

/// Release a registration's pool descriptor and DMA mapping
///
/// Returns false if the descriptor had already gone back to the pool.
pub(crate) fn unregister(pool: Option<&FastRegPool>, reg: Registration, owner: CmdTag) -> bool {
    let returned = match (pool, &reg.lease) {
        (Some(pool), Some(lease)) => pool.give_back(lease.index, owner),
        _ => true,
    };
    drop(reg);
    returned
}

/// Release a registration whose work requests were never posted
pub(crate) fn abandon(pool: Option<&FastRegPool>, reg: Registration, owner: CmdTag) -> bool {
    if let (Some(pool), Some(lease)) = (pool, &reg.lease) {
        pool.rollback(lease);
    }
    unregister(pool, reg, owner)
}

fn rdma_opcode(req: &RegRequest<'_>, done: u64) -> WrOpcode {
    let remote_addr = req.remote_va + req.offset as u64 + done;
    match req.dir {
        RdmaDir::Write => WrOpcode::RdmaWrite { remote_addr, rkey: req.remote_stag },
        RdmaDir::Read => WrOpcode::RdmaRead { remote_addr, rkey: req.remote_stag },
    }
}

fn build_direct(
    device: &Device,
    mapping: SgMapping,
    pieces: &[DmaSegment],
    req: &RegRequest<'_>,
) -> Registration {
    let lkey = device.dma_lkey();
    let mut wrs = Vec::new();
    let mut done = 0u64;
    for chunk in pieces.chunks(device.max_send_sge()) {
        let sg_list: Vec<Sge> = chunk
            .iter()
            .map(|seg| Sge { addr: seg.addr, length: seg.len, lkey })
            .collect();
        wrs.push(SendWr {
            wr_id: WrId::Rdma(req.tag).encode(),
            opcode: rdma_opcode(req, done),
            sg_list,
            signaled: false,
        });
        done += chunk.iter().map(|s| s.len as u64).sum::<u64>();
    }
    log::debug!(
        "{:?}: direct map, {} segments in {} work requests",
        req.tag,
        pieces.len(),
        wrs.len()
    );
    Registration { wrs, length: req.length, lease: None, _mapping: mapping }
}

fn build_fast_reg(
    pool: &FastRegPool,
    config: &TransportConfig,
    mapping: SgMapping,
    pieces: &[DmaSegment],
    page_list: Vec<u64>,
    req: &RegRequest<'_>,
) -> IsertResult<Registration> {
    let lease = pool.checkout(req.tag)?;
    let iova = pieces[0].addr;
    let wr_id = WrId::Reg(req.tag).encode();

    let mut wrs = Vec::with_capacity(3);
    if let Some(rkey) = lease.invalidate {
        wrs.push(SendWr { wr_id, opcode: WrOpcode::LocalInv { rkey }, sg_list: Vec::new(), signaled: false });
    }
    wrs.push(SendWr {
        wr_id,
        opcode: WrOpcode::FastReg(FastRegWr {
            mr: lease.mr,
            iova,
            length: req.length,
            page_size: config.page_size as u32,
            page_list,
            key: lease.key,
            access: access::LOCAL_WRITE | access::REMOTE_WRITE | access::REMOTE_READ,
        }),
        sg_list: Vec::new(),
        signaled: false,
    });
    wrs.push(SendWr {
        wr_id: WrId::Rdma(req.tag).encode(),
        opcode: rdma_opcode(req, 0),
        sg_list: vec![Sge { addr: iova, length: req.length, lkey: lease.key }],
        signaled: false,
    });
    log::debug!(
        "{:?}: fast registration desc {} key {:#x}, invalidate {:?}",
        req.tag,
        lease.index,
        lease.key,
        lease.invalidate
    );
    Ok(Registration { wrs, length: req.length, lease: Some(lease), _mapping: mapping })
}

/// Cut `[offset, offset + length)` out of a mapped segment list
fn slice_segments(segments: &[DmaSegment], offset: u32, length: u32) -> IsertResult<Vec<DmaSegment>> {
    let mut skip = offset as u64;
    let mut left = length as u64;
    let mut pieces = Vec::new();
    for seg in segments {
        if left == 0 {
            break;
        }
        let seg_len = seg.len as u64;
        if skip >= seg_len {
            skip -= seg_len;
            continue;
        }
        let take = (seg_len - skip).min(left);
        pieces.push(DmaSegment { addr: seg.addr + skip, len: take as u32 });
        left -= take;
        skip = 0;
    }
    if left > 0 {
        return Err(IsertError::InvalidTransfer(format!(
            "scatter-gather list too short: {} bytes missing at offset {}",
            left, offset
        )));
    }
    Ok(pieces)
}

/// Build a fast-registration page list from mapped segments
///
/// A segment whose end is not page aligned is merged with the next one into
/// a single chunk; every chunk contributes the pages from its first
/// page-aligned address up to its end.
pub fn build_page_list(segments: &[DmaSegment], page_size: u64) -> Vec<u64> {
    let page_mask = !(page_size - 1);
    let mut pages = Vec::new();
    let mut chunk_start = 0u64;
    let mut new_chunk = true;

    for (i, seg) in segments.iter().enumerate() {
        if new_chunk {
            chunk_start = seg.addr;
        }
        let end = seg.addr + seg.len as u64;
        if end & !page_mask != 0 && i + 1 < segments.len() {
            new_chunk = false;
            continue;
        }
        new_chunk = true;

        let mut page = chunk_start & page_mask;
        while page < end {
            pages.push(page);
            page += page_size;
        }
    }
    pages
}

/// Rotate the low byte of a memory key
pub fn bump_key(key: u32) -> u32 {
    (key & 0xFFFF_FF00) | ((key as u8).wrapping_add(1) as u32)
}

/// Pooled fast-registration memory regions of one connection
pub struct FastRegPool {
    verbs: Arc<dyn Verbs>,
    slots: Mutex<PoolSlots>,
}

struct PoolSlots {
    descs: Vec<FrDesc>,
    /// Indices of free descriptors
    free: Vec<usize>,
}

struct FrDesc {
    mr: MrKeys,
    /// Bound to pages; needs a local invalidate before reuse
    registered: bool,
    owner: Option<CmdTag>,
}

/// A checked-out descriptor
pub(crate) struct FrLease {
    pub(crate) index: usize,
    pub(crate) mr: MrHandle,
    /// Key to invalidate first
    pub(crate) invalidate: Option<u32>,
    /// Key for the new registration
    pub(crate) key: u32,
    prev_registered: bool,
    prev_key: u32,
}

impl FastRegPool {
    pub(crate) fn new(device: &Device, size: usize, max_pages: usize) -> IsertResult<Self> {
        let pool = FastRegPool {
            verbs: Arc::clone(device.verbs()),
            slots: Mutex::new(PoolSlots { descs: Vec::with_capacity(size), free: Vec::with_capacity(size) }),
        };
        let pd = device.pd()?;
        {
            let mut slots = lock(&pool.slots);
            for index in 0..size {
                // On failure `pool` drops and deregisters what was allocated
                let mr = pool.verbs.alloc_fast_reg_mr(pd, max_pages as u32)?;
                slots.descs.push(FrDesc { mr, registered: false, owner: None });
                slots.free.push(index);
            }
        }
        log::debug!("Allocated fast registration pool of {} descriptors", size);
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        lock(&self.slots).descs.len()
    }

    pub fn checked_out(&self) -> usize {
        let slots = lock(&self.slots);
        slots.descs.len() - slots.free.len()
    }

    /// Take a free descriptor and bind it to the next key
    ///
    /// The descriptor is recorded as registered under the new key right away;
    /// `rollback` undoes that if the work requests never reach the queue.
    pub(crate) fn checkout(&self, owner: CmdTag) -> IsertResult<FrLease> {
        let mut slots = lock(&self.slots);
        let index = slots.free.pop().ok_or_else(|| {
            IsertError::ResourceExhausted("no free fast registration descriptor".to_string())
        })?;
        let desc = &mut slots.descs[index];
        desc.owner = Some(owner);
        let prev_registered = desc.registered;
        let prev_key = desc.mr.rkey;
        let (invalidate, key) = if desc.registered {
            (Some(prev_key), bump_key(prev_key))
        } else {
            (None, prev_key)
        };
        desc.registered = true;
        desc.mr.lkey = key;
        desc.mr.rkey = key;
        Ok(FrLease { index, mr: desc.mr.handle, invalidate, key, prev_registered, prev_key })
    }

    fn rollback(&self, lease: &FrLease) {
        let mut slots = lock(&self.slots);
        if let Some(desc) = slots.descs.get_mut(lease.index) {
            desc.registered = lease.prev_registered;
            desc.mr.lkey = lease.prev_key;
            desc.mr.rkey = lease.prev_key;
        }
    }

    /// Return a descriptor; a descriptor not held by `owner` is left alone
    pub(crate) fn give_back(&self, index: usize, owner: CmdTag) -> bool {
        let mut slots = lock(&self.slots);
        match slots.descs.get_mut(index) {
            Some(desc) if desc.owner == Some(owner) => {
                desc.owner = None;
                slots.free.push(index);
                true
            }
            _ => {
                log::warn!("Descriptor {} is not held by {:?}, not returning it", index, owner);
                false
            }
        }
    }
}

impl Drop for FastRegPool {
    fn drop(&mut self) {
        let slots = lock(&self.slots);
        for desc in &slots.descs {
            self.verbs.dereg_mr(desc.mr.handle);
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
