//! Software verbs provider
//!
//! [`SoftRdma`] implements [`Verbs`] entirely in memory. It models what the
//! transport depends on: DMA mappings, global and fast-registration memory
//! regions, queue pairs with ordered send processing and the error state
//! with flush completions, completion queues with one-shot notification,
//! and connection-manager events. The initiator side is driven explicitly
//! (`connect`, `deliver`, `process_sends`), which makes every completion
//! ordering reproducible.

use crate::verbs::{
    lock, AdapterId, CmEvent, CmEventHandler, CmId, ConnParam, CqHandle, CqNotifier, DeviceAttr,
    DmaDirection, DmaSegment, HostBuffer, MrHandle, MrKeys, PdHandle, QpInitAttr, QpNum, RecvWr,
    SendWr, Sge, Verbs, VerbsError, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;

const SOFT_PAGE: u64 = 4096;
const DMA_BASE: u64 = 0x1_0000_0000;
const PEER_BASE: u64 = 0x7f00_0000_0000;

/// A message the target sent, as the initiator received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub wr_id: u64,
    pub bytes: Vec<u8>,
}

/// Live provider objects, for leak checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftStats {
    pub pds: usize,
    pub cqs: usize,
    pub mrs: usize,
    pub qps: usize,
    pub mappings: usize,
    pub cm_ids: usize,
    pub listeners: usize,
}

/// In-memory verbs provider
pub struct SoftRdma {
    state: Mutex<SoftState>,
}

#[derive(Default)]
struct SoftState {
    next_handle: u32,
    next_addr: u64,
    next_peer: u64,
    adapters: HashMap<AdapterId, DeviceAttr>,
    pds: HashMap<u32, AdapterId>,
    cqs: HashMap<u32, SoftCq>,
    mrs: HashMap<u32, SoftMr>,
    qps: HashMap<u32, SoftQp>,
    mappings: BTreeMap<u64, Mapping>,
    listeners: HashMap<CmId, Listening>,
    cm_ids: HashMap<CmId, CmConn>,
    peer_mem: HashMap<u32, PeerRegion>,
    sent: HashMap<QpNum, Vec<SentMessage>>,
    send_log: HashMap<QpNum, Vec<SendWr>>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    post_send: usize,
    post_recv: usize,
    dma_map_after: Option<usize>,
    next_send_status: HashMap<QpNum, WcStatus>,
}

struct SoftCq {
    depth: u32,
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    notifier: CqNotifier,
}

enum MrKind {
    Dma,
    FastReg { max_pages: u32, region: Option<FrRegion> },
}

struct FrRegion {
    iova: u64,
    length: u64,
    page_size: u64,
    page_list: Vec<u64>,
}

struct SoftMr {
    keys: MrKeys,
    kind: MrKind,
}

struct SoftQp {
    send_cq: u32,
    recv_cq: u32,
    max_send_wr: u32,
    max_recv_wr: u32,
    sq: VecDeque<SendWr>,
    rq: VecDeque<RecvWr>,
    error: bool,
}

struct Mapping {
    buf: HostBuffer,
    len: usize,
}

struct Listening {
    addr: SocketAddr,
    handler: CmEventHandler,
}

struct CmConn {
    listener: CmId,
    qp: Option<QpNum>,
    param: Option<ConnParam>,
    peer: SocketAddr,
    connected: bool,
}

struct PeerRegion {
    buf: HostBuffer,
    va: u64,
}

/// Work done under the state lock, to be announced after it is released
#[derive(Default)]
struct Deferred {
    notify: Vec<(CqNotifier, CqHandle)>,
    events: Vec<(CmEventHandler, CmEvent)>,
}

impl Deferred {
    fn fire(self) {
        for (notifier, cq) in self.notify {
            notifier(cq);
        }
        for (handler, event) in self.events {
            handler(event);
        }
    }
}

impl Default for SoftRdma {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftRdma {
    pub fn new() -> Self {
        SoftRdma {
            state: Mutex::new(SoftState {
                next_handle: 1,
                next_addr: DMA_BASE,
                next_peer: PEER_BASE,
                ..Default::default()
            }),
        }
    }

    /// Attributes of an adapter without memory-management extensions
    pub fn direct_attr() -> DeviceAttr {
        DeviceAttr {
            node_guid: 0x0002_c903_0000_0001,
            max_sge: 4,
            max_qp_wr: 4096,
            max_cqe: 65536,
            num_comp_vectors: 4,
            max_qp_rd_atom: 16,
            max_qp_init_rd_atom: 16,
            mem_mgt_extensions: false,
            max_fast_reg_page_list_len: 0,
        }
    }

    /// Attributes of an adapter supporting fast registration
    pub fn fast_reg_attr() -> DeviceAttr {
        DeviceAttr {
            node_guid: 0x0002_c903_0000_0002,
            mem_mgt_extensions: true,
            max_fast_reg_page_list_len: 512,
            ..Self::direct_attr()
        }
    }

    pub fn add_adapter(&self, adapter: AdapterId, attr: DeviceAttr) {
        lock(&self.state).adapters.insert(adapter, attr);
    }

    /// Initiator connects to a listening address; the listener sees a
    /// connect request for the returned id
    pub fn connect(&self, addr: SocketAddr, adapter: AdapterId) -> Result<CmId, VerbsError> {
        let (handler, event) = {
            let mut st = lock(&self.state);
            if !st.adapters.contains_key(&adapter) {
                return Err(VerbsError::NoSuchAdapter(adapter));
            }
            let (listener, handler) = st
                .listeners
                .iter()
                .find(|(_, l)| l.addr == addr)
                .map(|(id, l)| (*id, l.handler.clone()))
                .ok_or(VerbsError::Unsupported("no listener on address"))?;
            let id = CmId(st.handle());
            let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 40000u16.wrapping_add(id.0 as u16));
            st.cm_ids.insert(id, CmConn { listener, qp: None, param: None, peer, connected: false });
            let event = CmEvent::ConnectRequest {
                id,
                adapter,
                initiator_depth: 16,
                responder_resources: 16,
            };
            (handler, event)
        };
        handler(event);
        Ok(event.id())
    }

    /// Initiator side disconnect
    pub fn peer_disconnect(&self, id: CmId) {
        let deferred = {
            let mut st = lock(&self.state);
            st.disconnect(id)
        };
        deferred.fire();
    }

    /// Queue pair created for a connection id
    pub fn qp_of(&self, id: CmId) -> Option<QpNum> {
        lock(&self.state).cm_ids.get(&id).and_then(|c| c.qp)
    }

    /// Parameters the target accepted the connection with
    pub fn accepted_param(&self, id: CmId) -> Option<ConnParam> {
        lock(&self.state).cm_ids.get(&id).and_then(|c| c.param)
    }

    /// Deliver an initiator message into the next posted receive
    pub fn deliver(&self, qp: QpNum, bytes: &[u8]) -> Result<(), VerbsError> {
        let deferred = {
            let mut st = lock(&self.state);
            let mut deferred = Deferred::default();
            let q = st.qps.get_mut(&qp.0).ok_or(VerbsError::InvalidHandle("qp", qp.0))?;
            if q.error {
                return Err(VerbsError::PostRejected("queue pair in error state".to_string()));
            }
            let wr = q.rq.pop_front().ok_or(VerbsError::QueueFull)?;
            let recv_cq = q.recv_cq;
            let capacity: u64 = wr.sg_list.iter().map(|s| s.length as u64).sum();
            let status = if bytes.len() as u64 > capacity {
                WcStatus::LocalLengthError
            } else {
                match st.scatter(&wr.sg_list, bytes) {
                    Ok(()) => WcStatus::Success,
                    Err(status) => status,
                }
            };
            st.complete(recv_cq, wr.wr_id, status, WcOpcode::Recv, bytes.len() as u32, qp, &mut deferred);
            if status != WcStatus::Success {
                st.set_error(qp, &mut deferred);
            }
            deferred
        };
        deferred.fire();
        Ok(())
    }

    /// Execute queued send work requests in order; returns how many ran
    pub fn process_sends(&self, qp: QpNum) -> usize {
        let (done, deferred) = {
            let mut st = lock(&self.state);
            let mut deferred = Deferred::default();
            let mut done = 0;
            loop {
                let Some(q) = st.qps.get_mut(&qp.0) else { break };
                if q.error {
                    break;
                }
                let Some(wr) = q.sq.pop_front() else { break };
                let send_cq = q.send_cq;
                done += 1;
                let injected = st.faults.next_send_status.remove(&qp);
                let (status, byte_len) = match injected {
                    Some(status) => (status, 0),
                    None => st.execute(qp, &wr),
                };
                if status != WcStatus::Success || wr.signaled {
                    st.complete(send_cq, wr.wr_id, status, wc_opcode(&wr.opcode), byte_len, qp, &mut deferred);
                }
                if status != WcStatus::Success {
                    st.set_error(qp, &mut deferred);
                    break;
                }
            }
            (done, deferred)
        };
        deferred.fire();
        done
    }

    /// Make the next send work request processed on `qp` fail with `status`
    pub fn fail_next_send(&self, qp: QpNum, status: WcStatus) {
        lock(&self.state).faults.next_send_status.insert(qp, status);
    }

    /// Reject the next `n` post_send calls
    pub fn fail_next_post_send(&self, n: usize) {
        lock(&self.state).faults.post_send = n;
    }

    /// Reject the next `n` post_recv calls
    pub fn fail_next_post_recv(&self, n: usize) {
        lock(&self.state).faults.post_recv = n;
    }

    /// Let `n` more DMA map calls succeed, then fail them
    pub fn fail_dma_map_after(&self, n: usize) {
        lock(&self.state).faults.dma_map_after = Some(n);
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults = Faults::default();
    }

    /// Initiator memory the target may reach by RDMA; returns (rkey, va)
    pub fn register_peer_memory(&self, buf: HostBuffer) -> (u32, u64) {
        let mut st = lock(&self.state);
        let rkey = 0x8000_0000 | st.handle();
        let va = st.next_peer;
        st.next_peer += (buf.len() as u64).div_ceil(SOFT_PAGE) * SOFT_PAGE + SOFT_PAGE;
        st.peer_mem.insert(rkey, PeerRegion { buf, va });
        (rkey, va)
    }

    /// Messages sent on `qp` since the last call
    pub fn take_sent(&self, qp: QpNum) -> Vec<SentMessage> {
        lock(&self.state).sent.remove(&qp).unwrap_or_default()
    }

    /// Every send work request posted on `qp`, in post order
    pub fn send_log(&self, qp: QpNum) -> Vec<SendWr> {
        lock(&self.state).send_log.get(&qp).cloned().unwrap_or_default()
    }

    /// Send work requests queued and not yet processed
    pub fn queued_sends(&self, qp: QpNum) -> usize {
        lock(&self.state).qps.get(&qp.0).map_or(0, |q| q.sq.len())
    }

    /// Receives posted and not yet consumed
    pub fn posted_recvs(&self, qp: QpNum) -> usize {
        lock(&self.state).qps.get(&qp.0).map_or(0, |q| q.rq.len())
    }

    pub fn qp_in_error(&self, qp: QpNum) -> bool {
        lock(&self.state).qps.get(&qp.0).is_some_and(|q| q.error)
    }

    /// Completion-queue entries not yet polled
    pub fn queued_completions(&self) -> usize {
        lock(&self.state).cqs.values().map(|cq| cq.entries.len()).sum()
    }

    pub fn stats(&self) -> SoftStats {
        let st = lock(&self.state);
        SoftStats {
            pds: st.pds.len(),
            cqs: st.cqs.len(),
            mrs: st.mrs.len(),
            qps: st.qps.len(),
            mappings: st.mappings.len(),
            cm_ids: st.cm_ids.len(),
            listeners: st.listeners.len(),
        }
    }

    /// Whether a fast-registration key currently maps memory
    pub fn fast_reg_key_valid(&self, key: u32) -> bool {
        lock(&self.state).mrs.values().any(|mr| {
            matches!(mr.kind, MrKind::FastReg { region: Some(_), .. }) && mr.keys.rkey == key
        })
    }
}

fn wc_opcode(op: &WrOpcode) -> WcOpcode {
    match op {
        WrOpcode::Send => WcOpcode::Send,
        WrOpcode::RdmaWrite { .. } => WcOpcode::RdmaWrite,
        WrOpcode::RdmaRead { .. } => WcOpcode::RdmaRead,
        WrOpcode::LocalInv { .. } => WcOpcode::LocalInv,
        WrOpcode::FastReg(_) => WcOpcode::FastReg,
    }
}

impl SoftState {
    fn handle(&mut self) -> u32 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn map_buffer(&mut self, buf: &HostBuffer) -> Result<u64, VerbsError> {
        if let Some(left) = self.faults.dma_map_after.as_mut() {
            if *left == 0 {
                return Err(VerbsError::MappingFailed("injected mapping failure".to_string()));
            }
            *left -= 1;
        }
        let len = buf.len();
        let addr = self.next_addr;
        // Page aligned with a guard page between mappings
        self.next_addr += (len as u64).div_ceil(SOFT_PAGE).max(1) * SOFT_PAGE + SOFT_PAGE;
        self.mappings.insert(addr, Mapping { buf: buf.clone(), len });
        Ok(addr)
    }

    /// Host memory behind a DMA address range
    fn resolve_dma(&self, addr: u64, len: usize) -> Result<(HostBuffer, usize), WcStatus> {
        let (base, mapping) = self
            .mappings
            .range(..=addr)
            .next_back()
            .ok_or(WcStatus::LocalProtectionError)?;
        let offset = (addr - base) as usize;
        if offset + len > mapping.len {
            return Err(WcStatus::LocalProtectionError);
        }
        Ok((mapping.buf.clone(), offset))
    }

    /// Host memory pieces behind a local scatter entry
    fn resolve(&self, sge: &Sge) -> Result<Vec<(HostBuffer, usize, usize)>, WcStatus> {
        let len = sge.length as usize;
        let mr = self
            .mrs
            .values()
            .find(|mr| mr.keys.lkey == sge.lkey)
            .ok_or(WcStatus::LocalProtectionError)?;
        match &mr.kind {
            MrKind::Dma => {
                let (buf, offset) = self.resolve_dma(sge.addr, len)?;
                Ok(vec![(buf, offset, len)])
            }
            MrKind::FastReg { region: Some(region), .. } => {
                if sge.addr < region.iova || sge.addr + len as u64 > region.iova + region.length {
                    return Err(WcStatus::LocalProtectionError);
                }
                let first_offset = region.iova & (region.page_size - 1);
                let mut pos = first_offset + (sge.addr - region.iova);
                let mut left = len as u64;
                let mut pieces = Vec::new();
                while left > 0 {
                    let page = region
                        .page_list
                        .get((pos / region.page_size) as usize)
                        .ok_or(WcStatus::LocalProtectionError)?;
                    let in_page = pos % region.page_size;
                    let take = (region.page_size - in_page).min(left);
                    let (buf, offset) = self.resolve_dma(page + in_page, take as usize)?;
                    pieces.push((buf, offset, take as usize));
                    pos += take;
                    left -= take;
                }
                Ok(pieces)
            }
            MrKind::FastReg { region: None, .. } => Err(WcStatus::LocalProtectionError),
        }
    }

    fn gather(&self, sg_list: &[Sge]) -> Result<Vec<u8>, WcStatus> {
        let mut out = Vec::new();
        for sge in sg_list {
            for (buf, offset, len) in self.resolve(sge)? {
                let mut chunk = vec![0u8; len];
                buf.read_at(offset, &mut chunk).map_err(|_| WcStatus::LocalLengthError)?;
                out.extend_from_slice(&chunk);
            }
        }
        Ok(out)
    }

    fn scatter(&self, sg_list: &[Sge], mut data: &[u8]) -> Result<(), WcStatus> {
        for sge in sg_list {
            if data.is_empty() {
                break;
            }
            let take = (sge.length as usize).min(data.len());
            let sge = Sge { length: take as u32, ..*sge };
            for (buf, offset, len) in self.resolve(&sge)? {
                buf.write_at(offset, &data[..len]).map_err(|_| WcStatus::LocalLengthError)?;
                data = &data[len..];
            }
        }
        Ok(())
    }

    fn peer_range(&self, rkey: u32, addr: u64, len: usize) -> Result<(HostBuffer, usize), WcStatus> {
        let region = self.peer_mem.get(&rkey).ok_or(WcStatus::RemoteAccessError)?;
        let offset = addr.checked_sub(region.va).ok_or(WcStatus::RemoteAccessError)? as usize;
        if offset + len > region.buf.len() {
            return Err(WcStatus::RemoteAccessError);
        }
        Ok((region.buf.clone(), offset))
    }

    /// Run one send work request
    fn execute(&mut self, qp: QpNum, wr: &SendWr) -> (WcStatus, u32) {
        let result = match &wr.opcode {
            WrOpcode::Send => self.gather(&wr.sg_list).map(|bytes| {
                let len = bytes.len() as u32;
                self.sent.entry(qp).or_default().push(SentMessage { wr_id: wr.wr_id, bytes });
                len
            }),
            WrOpcode::RdmaWrite { remote_addr, rkey } => self.gather(&wr.sg_list).and_then(|bytes| {
                let (buf, offset) = self.peer_range(*rkey, *remote_addr, bytes.len())?;
                buf.write_at(offset, &bytes).map_err(|_| WcStatus::RemoteAccessError)?;
                Ok(bytes.len() as u32)
            }),
            WrOpcode::RdmaRead { remote_addr, rkey } => {
                let len: usize = wr.sg_list.iter().map(|s| s.length as usize).sum();
                self.peer_range(*rkey, *remote_addr, len).and_then(|(buf, offset)| {
                    let mut bytes = vec![0u8; len];
                    buf.read_at(offset, &mut bytes).map_err(|_| WcStatus::RemoteAccessError)?;
                    self.scatter(&wr.sg_list, &bytes)?;
                    Ok(len as u32)
                })
            }
            WrOpcode::LocalInv { rkey } => {
                match self.mrs.values_mut().find(|mr| mr.keys.rkey == *rkey) {
                    Some(SoftMr { kind: MrKind::FastReg { region, .. }, .. }) if region.is_some() => {
                        *region = None;
                        Ok(0)
                    }
                    _ => Err(WcStatus::LocalProtectionError),
                }
            }
            WrOpcode::FastReg(fr) => match self.mrs.get_mut(&fr.mr.0) {
                Some(SoftMr { keys, kind: MrKind::FastReg { max_pages, region } })
                    if region.is_none() && fr.page_list.len() <= *max_pages as usize =>
                {
                    keys.lkey = fr.key;
                    keys.rkey = fr.key;
                    *region = Some(FrRegion {
                        iova: fr.iova,
                        length: fr.length as u64,
                        page_size: fr.page_size as u64,
                        page_list: fr.page_list.clone(),
                    });
                    Ok(0)
                }
                _ => Err(WcStatus::LocalProtectionError),
            },
        };
        match result {
            Ok(len) => (WcStatus::Success, len),
            Err(status) => (status, 0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn complete(
        &mut self,
        cq: u32,
        wr_id: u64,
        status: WcStatus,
        opcode: WcOpcode,
        byte_len: u32,
        qp: QpNum,
        deferred: &mut Deferred,
    ) {
        let Some(cq_state) = self.cqs.get_mut(&cq) else { return };
        if cq_state.entries.len() >= cq_state.depth as usize {
            log::error!("Soft CQ {} overflow, dropping completion {:#x}", cq, wr_id);
            return;
        }
        cq_state.entries.push_back(WorkCompletion { wr_id, status, opcode, byte_len, qp_num: qp, vendor_err: 0 });
        if cq_state.armed {
            cq_state.armed = false;
            deferred.notify.push((cq_state.notifier.clone(), CqHandle(cq)));
        }
    }

    /// Move a queue pair to the error state, flushing everything queued
    fn set_error(&mut self, qp: QpNum, deferred: &mut Deferred) {
        let Some(q) = self.qps.get_mut(&qp.0) else { return };
        q.error = true;
        let sends: Vec<SendWr> = q.sq.drain(..).collect();
        let recvs: Vec<RecvWr> = q.rq.drain(..).collect();
        let (send_cq, recv_cq) = (q.send_cq, q.recv_cq);
        for wr in sends {
            self.complete(send_cq, wr.wr_id, WcStatus::WrFlushError, wc_opcode(&wr.opcode), 0, qp, deferred);
        }
        for wr in recvs {
            self.complete(recv_cq, wr.wr_id, WcStatus::WrFlushError, WcOpcode::Recv, 0, qp, deferred);
        }
    }

    fn disconnect(&mut self, id: CmId) -> Deferred {
        let mut deferred = Deferred::default();
        let Some(conn) = self.cm_ids.get_mut(&id) else { return deferred };
        let qp = conn.qp;
        let was_connected = std::mem::replace(&mut conn.connected, false);
        let listener = conn.listener;
        if let Some(qp) = qp {
            self.set_error(qp, &mut deferred);
        }
        if was_connected {
            if let Some(l) = self.listeners.get(&listener) {
                deferred.events.push((l.handler.clone(), CmEvent::Disconnected { id }));
            }
        }
        deferred
    }
}

impl Verbs for SoftRdma {
    fn query_device(&self, adapter: AdapterId) -> Result<DeviceAttr, VerbsError> {
        lock(&self.state).adapters.get(&adapter).cloned().ok_or(VerbsError::NoSuchAdapter(adapter))
    }

    fn alloc_pd(&self, adapter: AdapterId) -> Result<PdHandle, VerbsError> {
        let mut st = lock(&self.state);
        if !st.adapters.contains_key(&adapter) {
            return Err(VerbsError::NoSuchAdapter(adapter));
        }
        let h = st.handle();
        st.pds.insert(h, adapter);
        Ok(PdHandle(h))
    }

    fn dealloc_pd(&self, pd: PdHandle) {
        lock(&self.state).pds.remove(&pd.0);
    }

    fn create_cq(
        &self,
        adapter: AdapterId,
        depth: u32,
        _vector: u32,
        notifier: CqNotifier,
    ) -> Result<CqHandle, VerbsError> {
        let mut st = lock(&self.state);
        if !st.adapters.contains_key(&adapter) {
            return Err(VerbsError::NoSuchAdapter(adapter));
        }
        let h = st.handle();
        st.cqs.insert(h, SoftCq { depth, entries: VecDeque::new(), armed: false, notifier });
        Ok(CqHandle(h))
    }

    fn destroy_cq(&self, cq: CqHandle) {
        lock(&self.state).cqs.remove(&cq.0);
    }

    fn req_notify_cq(&self, cq: CqHandle) -> Result<(), VerbsError> {
        let mut st = lock(&self.state);
        let c = st.cqs.get_mut(&cq.0).ok_or(VerbsError::InvalidHandle("cq", cq.0))?;
        c.armed = true;
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle) -> Option<WorkCompletion> {
        lock(&self.state).cqs.get_mut(&cq.0).and_then(|c| c.entries.pop_front())
    }

    fn get_dma_mr(&self, pd: PdHandle, _access: u32) -> Result<MrKeys, VerbsError> {
        let mut st = lock(&self.state);
        if !st.pds.contains_key(&pd.0) {
            return Err(VerbsError::InvalidHandle("pd", pd.0));
        }
        let h = st.handle();
        let keys = MrKeys { handle: MrHandle(h), lkey: h << 8, rkey: h << 8 };
        st.mrs.insert(h, SoftMr { keys, kind: MrKind::Dma });
        Ok(keys)
    }

    fn alloc_fast_reg_mr(&self, pd: PdHandle, max_pages: u32) -> Result<MrKeys, VerbsError> {
        let mut st = lock(&self.state);
        let adapter = *st.pds.get(&pd.0).ok_or(VerbsError::InvalidHandle("pd", pd.0))?;
        let supported = st.adapters.get(&adapter).is_some_and(|a| a.mem_mgt_extensions);
        if !supported {
            return Err(VerbsError::Unsupported("fast registration"));
        }
        let h = st.handle();
        let keys = MrKeys { handle: MrHandle(h), lkey: h << 8, rkey: h << 8 };
        st.mrs.insert(h, SoftMr { keys, kind: MrKind::FastReg { max_pages, region: None } });
        Ok(keys)
    }

    fn dereg_mr(&self, mr: MrHandle) {
        lock(&self.state).mrs.remove(&mr.0);
    }

    fn create_qp(&self, id: CmId, pd: PdHandle, attr: &QpInitAttr) -> Result<QpNum, VerbsError> {
        let mut st = lock(&self.state);
        if !st.pds.contains_key(&pd.0) {
            return Err(VerbsError::InvalidHandle("pd", pd.0));
        }
        if !st.cqs.contains_key(&attr.send_cq.0) || !st.cqs.contains_key(&attr.recv_cq.0) {
            return Err(VerbsError::InvalidHandle("cq", attr.send_cq.0));
        }
        if !st.cm_ids.contains_key(&id) {
            return Err(VerbsError::InvalidHandle("cm_id", id.0));
        }
        let h = st.handle();
        st.qps.insert(
            h,
            SoftQp {
                send_cq: attr.send_cq.0,
                recv_cq: attr.recv_cq.0,
                max_send_wr: attr.max_send_wr,
                max_recv_wr: attr.max_recv_wr,
                sq: VecDeque::new(),
                rq: VecDeque::new(),
                error: false,
            },
        );
        if let Some(conn) = st.cm_ids.get_mut(&id) {
            conn.qp = Some(QpNum(h));
        }
        Ok(QpNum(h))
    }

    fn destroy_qp(&self, qp: QpNum) {
        let mut st = lock(&self.state);
        st.qps.remove(&qp.0);
        for conn in st.cm_ids.values_mut() {
            if conn.qp == Some(qp) {
                conn.qp = None;
            }
        }
    }

    fn post_send(&self, qp: QpNum, wrs: &[SendWr]) -> Result<(), VerbsError> {
        let deferred = {
            let mut st = lock(&self.state);
            if st.faults.post_send > 0 {
                st.faults.post_send -= 1;
                return Err(VerbsError::PostRejected("injected post_send failure".to_string()));
            }
            let mut deferred = Deferred::default();
            let q = st.qps.get_mut(&qp.0).ok_or(VerbsError::InvalidHandle("qp", qp.0))?;
            if q.sq.len() + wrs.len() > q.max_send_wr as usize {
                return Err(VerbsError::QueueFull);
            }
            let (error, send_cq) = (q.error, q.send_cq);
            if !error {
                q.sq.extend(wrs.iter().cloned());
            }
            st.send_log.entry(qp).or_default().extend(wrs.iter().cloned());
            if error {
                for wr in wrs {
                    st.complete(send_cq, wr.wr_id, WcStatus::WrFlushError, wc_opcode(&wr.opcode), 0, qp, &mut deferred);
                }
            }
            deferred
        };
        deferred.fire();
        Ok(())
    }

    fn post_recv(&self, qp: QpNum, wrs: &[RecvWr]) -> Result<(), VerbsError> {
        let deferred = {
            let mut st = lock(&self.state);
            if st.faults.post_recv > 0 {
                st.faults.post_recv -= 1;
                return Err(VerbsError::PostRejected("injected post_recv failure".to_string()));
            }
            let mut deferred = Deferred::default();
            let q = st.qps.get_mut(&qp.0).ok_or(VerbsError::InvalidHandle("qp", qp.0))?;
            if q.rq.len() + wrs.len() > q.max_recv_wr as usize {
                return Err(VerbsError::QueueFull);
            }
            let (error, recv_cq) = (q.error, q.recv_cq);
            if error {
                for wr in wrs {
                    st.complete(recv_cq, wr.wr_id, WcStatus::WrFlushError, WcOpcode::Recv, 0, qp, &mut deferred);
                }
            } else {
                q.rq.extend(wrs.iter().cloned());
            }
            deferred
        };
        deferred.fire();
        Ok(())
    }

    fn dma_map_single(&self, adapter: AdapterId, buf: &HostBuffer, _dir: DmaDirection) -> Result<u64, VerbsError> {
        let mut st = lock(&self.state);
        if !st.adapters.contains_key(&adapter) {
            return Err(VerbsError::NoSuchAdapter(adapter));
        }
        st.map_buffer(buf)
    }

    fn dma_unmap_single(&self, _adapter: AdapterId, addr: u64, _len: usize, _dir: DmaDirection) {
        if lock(&self.state).mappings.remove(&addr).is_none() {
            log::warn!("Soft unmap of unknown address {:#x}", addr);
        }
    }

    fn dma_map_sg(
        &self,
        adapter: AdapterId,
        sg: &[HostBuffer],
        _dir: DmaDirection,
    ) -> Result<Vec<DmaSegment>, VerbsError> {
        let mut st = lock(&self.state);
        if !st.adapters.contains_key(&adapter) {
            return Err(VerbsError::NoSuchAdapter(adapter));
        }
        let mut segments = Vec::with_capacity(sg.len());
        for buf in sg {
            match st.map_buffer(buf) {
                Ok(addr) => segments.push(DmaSegment { addr, len: buf.len() as u32 }),
                Err(e) => {
                    for seg in &segments {
                        st.mappings.remove(&seg.addr);
                    }
                    return Err(e);
                }
            }
        }
        Ok(segments)
    }

    fn dma_unmap_sg(&self, _adapter: AdapterId, segments: &[DmaSegment], _dir: DmaDirection) {
        let mut st = lock(&self.state);
        for seg in segments {
            if st.mappings.remove(&seg.addr).is_none() {
                log::warn!("Soft unmap of unknown segment {:#x}", seg.addr);
            }
        }
    }

    fn sync_for_cpu(&self, _adapter: AdapterId, _addr: u64, _len: usize, _dir: DmaDirection) {}

    fn sync_for_device(&self, _adapter: AdapterId, _addr: u64, _len: usize, _dir: DmaDirection) {}

    fn listen(&self, addr: SocketAddr, _backlog: u32, handler: CmEventHandler) -> Result<CmId, VerbsError> {
        let mut st = lock(&self.state);
        if st.listeners.values().any(|l| l.addr == addr) {
            return Err(VerbsError::AddrInUse(addr));
        }
        let id = CmId(st.handle());
        st.listeners.insert(id, Listening { addr, handler });
        Ok(id)
    }

    fn accept(&self, id: CmId, param: &ConnParam) -> Result<(), VerbsError> {
        let event = {
            let mut st = lock(&self.state);
            let conn = st.cm_ids.get_mut(&id).ok_or(VerbsError::InvalidHandle("cm_id", id.0))?;
            conn.param = Some(*param);
            conn.connected = true;
            let listener = conn.listener;
            st.listeners.get(&listener).map(|l| (l.handler.clone(), CmEvent::Established { id }))
        };
        if let Some((handler, event)) = event {
            handler(event);
        }
        Ok(())
    }

    fn disconnect(&self, id: CmId) -> Result<(), VerbsError> {
        let deferred = {
            let mut st = lock(&self.state);
            if !st.cm_ids.contains_key(&id) {
                return Err(VerbsError::InvalidHandle("cm_id", id.0));
            }
            st.disconnect(id)
        };
        deferred.fire();
        Ok(())
    }

    fn destroy_id(&self, id: CmId) {
        let mut st = lock(&self.state);
        st.cm_ids.remove(&id);
        st.listeners.remove(&id);
    }

    fn route(&self, id: CmId) -> Option<(SocketAddr, SocketAddr)> {
        let st = lock(&self.state);
        let conn = st.cm_ids.get(&id)?;
        let local = st.listeners.get(&conn.listener)?.addr;
        Some((local, conn.peer))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
