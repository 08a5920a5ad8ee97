//! iSER connection
//!
//! A connection owns its queue pair, receive ring, login buffers, command
//! contexts and (on fast-registration devices) a registration pool. It
//! moves through `Init -> Up -> Terminating -> Down`; every work request
//! posted is counted, and the connection reaches `Down` only once both
//! counts are back at zero after teardown began.
//!
//! Fields of [`ConnInner`] are declared in teardown order: the queue pair
//! goes first, the device reference last.

use crate::config::CompletionMode;
use crate::device::{Device, QueuePair};
use crate::error::{IsertError, IsertResult};
use crate::handler::{LoginPdu, ResponseState};
use crate::proto::IserHeader;
use crate::registration::{self, FastRegPool, RegStrategy, Registration};
use crate::rx::{LoginBuffers, RxRing};
use crate::transport::{DeferredWork, Shared};
use crate::tx::{Coalesce, TxDesc};
use crate::verbs::{lock, AdapterId, CmId, ConnParam, HostBuffer, QpNum, Verbs};
use crossbeam::channel::{Receiver, Sender};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// State transitions remembered per connection
const STATE_HISTORY: usize = 4;

/// Connection identifier, unique per transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Default)]
pub enum ConnState {
    /// Created from a connect request, in login
    #[default]
    Init,
    /// Login complete, full feature phase
    Up,
    /// Teardown requested, outstanding work draining
    Terminating,
    /// All work drained
    Down,
}

/// Handle to a command context of one connection
///
/// The generation makes a stale tag from a released context miss instead of
/// aliasing the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdTag {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl CmdTag {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// What a work request was posted for, carried in its 64-bit id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WrId {
    /// Receive ring slot
    Rx(u32),
    LoginRx,
    LoginTx,
    /// The send (or last RDMA Read) that completes a command
    Cmd(CmdTag),
    /// Local invalidate or fast registration for a command
    Reg(CmdTag),
    /// Unsignaled RDMA work request of a command
    Rdma(CmdTag),
    /// Drain marker posted at teardown
    Beacon,
}

const WR_KIND_SHIFT: u32 = 56;
const WR_GEN_SHIFT: u32 = 32;
const WR_GEN_MASK: u64 = 0xFF_FFFF;

impl WrId {
    pub(crate) fn encode(self) -> u64 {
        let (kind, gen, index) = match self {
            WrId::Rx(i) => (1u64, 0u64, i),
            WrId::LoginRx => (2, 0, 0),
            WrId::LoginTx => (3, 0, 0),
            WrId::Cmd(t) => (4, t.generation as u64, t.index),
            WrId::Reg(t) => (5, t.generation as u64, t.index),
            WrId::Rdma(t) => (6, t.generation as u64, t.index),
            WrId::Beacon => (7, 0, 0),
        };
        (kind << WR_KIND_SHIFT) | ((gen & WR_GEN_MASK) << WR_GEN_SHIFT) | index as u64
    }

    pub(crate) fn decode(wr_id: u64) -> Option<WrId> {
        let index = wr_id as u32;
        let generation = ((wr_id >> WR_GEN_SHIFT) & WR_GEN_MASK) as u32;
        let tag = CmdTag { index, generation };
        match wr_id >> WR_KIND_SHIFT {
            1 => Some(WrId::Rx(index)),
            2 => Some(WrId::LoginRx),
            3 => Some(WrId::LoginTx),
            4 => Some(WrId::Cmd(tag)),
            5 => Some(WrId::Reg(tag)),
            6 => Some(WrId::Rdma(tag)),
            7 => Some(WrId::Beacon),
            _ => None,
        }
    }
}

/// Data buffer the upper layer attaches to a command before an RDMA transfer
#[derive(Debug, Clone)]
pub struct DataBuffer {
    pub sg: Vec<HostBuffer>,
    /// Total transfer length; may be shorter than the buffers
    pub length: u32,
}

/// Snapshot of a command context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub itt: u32,
    pub opcode: u8,
    /// Initiator buffer for Data-In, from the transport header
    pub read_target: Option<(u32, u64)>,
    /// Initiator buffer holding Data-Out
    pub write_target: Option<(u32, u64)>,
    pub data_length: Option<u32>,
    /// Bytes of Data-Out fetched so far
    pub write_data_done: u32,
    pub in_flight: bool,
}

/// What the command's outstanding work request is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdOp {
    Idle,
    Send,
    RdmaRead,
}

/// Per-command transport context
pub(crate) struct IsertCmd {
    pub(crate) itt: u32,
    pub(crate) opcode: u8,
    pub(crate) header: IserHeader,
    pub(crate) data: Option<DataBuffer>,
    pub(crate) write_data_done: u32,
    pub(crate) state: Option<ResponseState>,
    pub(crate) op: CmdOp,
    pub(crate) tx: Option<TxDesc>,
    pub(crate) reg: Option<Registration>,
}

impl IsertCmd {
    pub(crate) fn new(itt: u32, opcode: u8, header: IserHeader) -> Self {
        IsertCmd {
            itt,
            opcode,
            header,
            data: None,
            write_data_done: 0,
            state: None,
            op: CmdOp::Idle,
            tx: None,
            reg: None,
        }
    }
}

struct CmdSlot {
    generation: u32,
    cmd: Option<IsertCmd>,
}

/// Bounded slab of command contexts
pub(crate) struct CmdArena {
    slots: Vec<CmdSlot>,
    free: Vec<u32>,
    live: usize,
    max: usize,
}

impl CmdArena {
    pub(crate) fn new(max: usize) -> Self {
        CmdArena { slots: Vec::new(), free: Vec::new(), live: 0, max }
    }

    pub(crate) fn insert(&mut self, cmd: IsertCmd) -> IsertResult<CmdTag> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.max => {
                self.slots.push(CmdSlot { generation: 0, cmd: None });
                (self.slots.len() - 1) as u32
            }
            None => {
                return Err(IsertError::ResourceExhausted(format!(
                    "all {} command contexts in use",
                    self.max
                )))
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.cmd = Some(cmd);
        self.live += 1;
        Ok(CmdTag { index, generation: slot.generation })
    }

    fn slot(&self, tag: CmdTag) -> Option<&CmdSlot> {
        self.slots.get(tag.index as usize).filter(|s| s.generation == tag.generation)
    }

    pub(crate) fn get(&self, tag: CmdTag) -> Option<&IsertCmd> {
        self.slot(tag).and_then(|s| s.cmd.as_ref())
    }

    pub(crate) fn get_mut(&mut self, tag: CmdTag) -> Option<&mut IsertCmd> {
        self.slots
            .get_mut(tag.index as usize)
            .filter(|s| s.generation == tag.generation)
            .and_then(|s| s.cmd.as_mut())
    }

    pub(crate) fn remove(&mut self, tag: CmdTag) -> Option<IsertCmd> {
        let slot = self
            .slots
            .get_mut(tag.index as usize)
            .filter(|s| s.generation == tag.generation)?;
        let cmd = slot.cmd.take()?;
        slot.generation = (slot.generation + 1) & WR_GEN_MASK as u32;
        self.free.push(tag.index);
        self.live -= 1;
        Some(cmd)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

pub(crate) struct StateInner {
    pub(crate) state: ConnState,
    /// Most recent states, oldest first
    history: Vec<ConnState>,
    disconnect_requested: bool,
    teardown_scheduled: bool,
    /// The upper layer is freeing the connection itself
    pub(crate) freeing: bool,
    pub(crate) logout_posted: bool,
}

/// Releases the connection manager id after the queue pair is gone
pub(crate) struct CmIdGuard {
    verbs: Arc<dyn Verbs>,
    pub(crate) id: CmId,
}

impl CmIdGuard {
    pub(crate) fn new(verbs: Arc<dyn Verbs>, id: CmId) -> Self {
        CmIdGuard { verbs, id }
    }
}

impl Drop for CmIdGuard {
    fn drop(&mut self) {
        self.verbs.destroy_id(self.id);
    }
}

pub(crate) struct ConnInner {
    pub(crate) id: ConnectionId,
    pub(crate) shared: Arc<Shared>,
    pub(crate) qp: QueuePair,
    pub(crate) cm: CmIdGuard,
    pub(crate) param: ConnParam,
    pub(crate) state: Mutex<StateInner>,
    pub(crate) state_cv: Condvar,
    pub(crate) post_send_count: AtomicUsize,
    pub(crate) post_recv_count: AtomicUsize,
    pub(crate) accounting_errors: AtomicUsize,
    pub(crate) cmds: Mutex<CmdArena>,
    pub(crate) login_tx: Mutex<Option<TxDesc>>,
    pub(crate) rx_ring: Mutex<Option<RxRing>>,
    pub(crate) login: LoginBuffers,
    pub(crate) comp: Mutex<Coalesce>,
    pub(crate) fr_pool: Option<FastRegPool>,
    pub(crate) login_queue: Sender<LoginPdu>,
    pub(crate) login_rx: Receiver<LoginPdu>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) device: Device,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let cmds = lock(&self.cmds).len();
        if cmds > 0 {
            log::debug!("Conn {}: dropping {} command contexts", self.id, cmds);
        }
        log::info!("Conn {}: released", self.id);
    }
}

/// Shared handle to an iSER connection
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("qp", &self.inner.qp.qp)
            .finish()
    }
}

impl Connection {
    /// Build a connection for an incoming connect request
    ///
    /// Resources are acquired in order and released in reverse if a later
    /// step fails.
    pub(crate) fn create(
        shared: &Arc<Shared>,
        cm_id: CmId,
        adapter: AdapterId,
        initiator_depth: u8,
        responder_resources: u8,
    ) -> IsertResult<Connection> {
        let cm = CmIdGuard::new(Arc::clone(&shared.verbs), cm_id);
        let config = &shared.config;
        let device = shared.registry.find_or_create(adapter)?;
        let login = LoginBuffers::new(&device, config)?;
        let fr_pool = match device.strategy() {
            RegStrategy::FastRegistrationPool => Some(FastRegPool::new(
                &device,
                config.fastreg_pool_size,
                config.max_fastreg_pages,
            )?),
            RegStrategy::DirectDmaMap => None,
        };
        let qp = QueuePair::create(&device, cm_id, config)?;

        let attr = device.attr();
        let param = ConnParam {
            initiator_depth: initiator_depth
                .min(attr.max_qp_init_rd_atom)
                .min(config.initiator_depth),
            responder_resources: responder_resources
                .min(attr.max_qp_rd_atom)
                .min(config.responder_resources),
            retry_count: config.retry_count,
            rnr_retry_count: config.rnr_retry_count,
        };
        let (local_addr, peer_addr) = shared.verbs.route(cm_id).unzip();
        let (login_queue, login_rx) = crossbeam::channel::unbounded();
        let id = shared.next_connection_id();

        let inner = Arc::new(ConnInner {
            id,
            shared: Arc::clone(shared),
            qp,
            cm,
            param,
            state: Mutex::new(StateInner {
                state: ConnState::Init,
                history: vec![ConnState::Init],
                disconnect_requested: false,
                teardown_scheduled: false,
                freeing: false,
                logout_posted: false,
            }),
            state_cv: Condvar::new(),
            post_send_count: AtomicUsize::new(0),
            post_recv_count: AtomicUsize::new(0),
            accounting_errors: AtomicUsize::new(0),
            cmds: Mutex::new(CmdArena::new(config.max_commands)),
            login_tx: Mutex::new(None),
            rx_ring: Mutex::new(None),
            login,
            comp: Mutex::new(Coalesce::default()),
            fr_pool,
            login_queue,
            login_rx,
            local_addr,
            peer_addr,
            device,
        });
        inner.device.attach_qp(inner.qp.qp, Arc::downgrade(&inner));
        log::info!(
            "Conn {}: created on QP {:?}, CQ pair {}, peer {:?}",
            id,
            inner.qp.qp,
            inner.qp.cq_index,
            peer_addr
        );
        Ok(Connection { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnInner>) -> Self {
        Connection { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnState {
        lock(&self.inner.state).state
    }

    /// Recent states, oldest first, ending with the current one
    pub fn state_history(&self) -> Vec<ConnState> {
        lock(&self.inner.state).history.clone()
    }

    pub fn outstanding_sends(&self) -> usize {
        self.inner.post_send_count.load(Ordering::Acquire)
    }

    pub fn outstanding_receives(&self) -> usize {
        self.inner.post_recv_count.load(Ordering::Acquire)
    }

    /// Completions that arrived for work the connection had not counted
    pub fn accounting_errors(&self) -> usize {
        self.inner.accounting_errors.load(Ordering::Acquire)
    }

    pub fn qp_num(&self) -> QpNum {
        self.inner.qp.qp
    }

    /// Completion-queue pair the queue pair was placed on
    pub fn cq_index(&self) -> usize {
        self.inner.qp.cq_index
    }

    pub fn cm_id(&self) -> CmId {
        self.inner.cm.id
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Parameters the connection was accepted with
    pub fn conn_param(&self) -> ConnParam {
        self.inner.param
    }

    pub fn login_request_len(&self) -> usize {
        self.inner.login.req.len
    }

    pub fn login_response_len(&self) -> usize {
        self.inner.login.rsp.len
    }

    pub fn registration_strategy(&self) -> RegStrategy {
        self.inner.device.strategy()
    }

    pub fn fastreg_pool(&self) -> Option<&FastRegPool> {
        self.inner.fr_pool.as_ref()
    }

    /// Whether a logout response has gone out on this connection
    pub fn logout_posted(&self) -> bool {
        lock(&self.inner.state).logout_posted
    }

    /// Live command contexts
    pub fn command_count(&self) -> usize {
        lock(&self.inner.cmds).len()
    }

    pub fn command_info(&self, tag: CmdTag) -> Option<CommandInfo> {
        let cmds = lock(&self.inner.cmds);
        cmds.get(tag).map(|cmd| CommandInfo {
            itt: cmd.itt,
            opcode: cmd.opcode,
            read_target: cmd.header.read_target(),
            write_target: cmd.header.write_target(),
            data_length: cmd.data.as_ref().map(|d| d.length),
            write_data_done: cmd.write_data_done,
            in_flight: cmd.op != CmdOp::Idle,
        })
    }

    /// Attach the buffer an RDMA transfer moves data to or from
    pub fn set_data_buffer(&self, tag: CmdTag, data: DataBuffer) -> IsertResult<()> {
        let total: u64 = data.sg.iter().map(|b| b.len() as u64).sum();
        if total < data.length as u64 {
            return Err(IsertError::InvalidTransfer(format!(
                "buffers hold {} bytes, transfer needs {}",
                total, data.length
            )));
        }
        let mut cmds = lock(&self.inner.cmds);
        let cmd = cmds.get_mut(tag).ok_or_else(|| unknown_command(tag))?;
        if cmd.op != CmdOp::Idle {
            return Err(IsertError::InvalidState(format!("{:?} has work in flight", tag)));
        }
        cmd.data = Some(data);
        Ok(())
    }

    /// Account for Data-Out that arrived without an RDMA Read (immediate
    /// data); the next `get_dataout` starts after it
    pub fn add_write_data_done(&self, tag: CmdTag, bytes: u32) -> IsertResult<()> {
        let mut cmds = lock(&self.inner.cmds);
        let cmd = cmds.get_mut(tag).ok_or_else(|| unknown_command(tag))?;
        cmd.write_data_done = cmd.write_data_done.checked_add(bytes).ok_or_else(|| {
            IsertError::InvalidTransfer(format!("{:?}: Data-Out offset overflow", tag))
        })?;
        Ok(())
    }

    /// Block until the connection reaches `state` or a later one
    pub fn wait_for_state(&self, state: ConnState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = lock(&self.inner.state);
        while st.state < state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .inner
                .state_cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    pub(crate) fn verbs(&self) -> &Arc<dyn Verbs> {
        &self.inner.shared.verbs
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub(crate) fn alloc_command(&self, itt: u32, opcode: u8, header: IserHeader) -> IsertResult<CmdTag> {
        lock(&self.inner.cmds).insert(IsertCmd::new(itt, opcode, header))
    }

    /// Drop a command context with its descriptors and registration, then
    /// tell the upper layer
    pub(crate) fn release_cmd(&self, tag: CmdTag) {
        let Some(mut cmd) = lock(&self.inner.cmds).remove(tag) else {
            log::debug!("Conn {}: {:?} already released", self.inner.id, tag);
            return;
        };
        if let Some(reg) = cmd.reg.take() {
            registration::unregister(self.inner.fr_pool.as_ref(), reg, tag);
        }
        drop(cmd);
        self.inner.shared.handler.release_command(self, tag);
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Move to `next` if it is later than the current state
    fn transition_locked(&self, st: &mut StateInner, next: ConnState) -> Option<(ConnState, ConnState)> {
        if next <= st.state {
            return None;
        }
        let from = st.state;
        st.state = next;
        if st.history.len() == STATE_HISTORY {
            st.history.remove(0);
        }
        st.history.push(next);
        self.inner.state_cv.notify_all();
        Some((from, next))
    }

    fn announce(&self, change: Option<(ConnState, ConnState)>) {
        if let Some((from, to)) = change {
            log::info!("Conn {}: {:?} -> {:?}", self.inner.id, from, to);
            self.inner.shared.handler.state_changed(self.inner.id, from, to);
        }
    }

    /// Login finished; enter full feature phase
    pub(crate) fn set_up(&self) -> IsertResult<()> {
        let change = {
            let mut st = lock(&self.inner.state);
            if st.state != ConnState::Init {
                return Err(IsertError::InvalidState(format!(
                    "conn {} cannot go up from {:?}",
                    self.inner.id, st.state
                )));
            }
            self.transition_locked(&mut st, ConnState::Up)
        };
        self.announce(change);
        Ok(())
    }

    /// Move to `Terminating` and schedule a disconnect on the deferred worker
    pub(crate) fn force_terminating(&self) {
        let change = {
            let mut st = lock(&self.inner.state);
            self.transition_locked(&mut st, ConnState::Terminating)
        };
        self.announce(change);
        self.schedule_teardown();
    }

    /// Queue a disconnect on the deferred worker, at most once
    pub(crate) fn schedule_teardown(&self) {
        {
            let mut st = lock(&self.inner.state);
            if st.teardown_scheduled || st.state == ConnState::Down {
                return;
            }
            st.teardown_scheduled = true;
        }
        log::debug!("Conn {}: teardown scheduled", self.inner.id);
        self.inner.shared.defer(DeferredWork::Disconnect(self.clone()));
    }

    fn drained(&self) -> bool {
        self.outstanding_sends() == 0 && self.outstanding_receives() == 0
    }

    /// `Terminating` with nothing outstanding becomes `Down`
    pub(crate) fn check_drained(&self) {
        let change = {
            let mut st = lock(&self.inner.state);
            if st.state == ConnState::Terminating && self.drained() {
                self.transition_locked(&mut st, ConnState::Down)
            } else {
                None
            }
        };
        self.announce(change);
    }

    /// Start teardown: disconnect once, flush the queues and post the drain
    /// beacon. Returns true if the connection is already down.
    pub(crate) fn begin_teardown(&self) -> bool {
        let (first, change, down) = {
            let mut st = lock(&self.inner.state);
            if st.state == ConnState::Down {
                return true;
            }
            let first = !st.disconnect_requested;
            st.disconnect_requested = true;
            let next = if self.drained() { ConnState::Down } else { ConnState::Terminating };
            let change = self.transition_locked(&mut st, next);
            (first, change, st.state == ConnState::Down)
        };
        self.announce(change);
        if first {
            log::info!("Conn {}: disconnecting", self.inner.id);
            if let Err(e) = self.verbs().disconnect(self.inner.cm.id) {
                log::warn!("Conn {}: disconnect failed: {}", self.inner.id, e);
            }
            if !down {
                self.post_beacon();
            }
        }
        down
    }

    /// Wait for `Down`, draining our own completion queues when the
    /// transport runs in polled mode
    pub(crate) fn wait_for_down(&self, timeout: Duration, drive: bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if drive {
                self.inner.device.poll_completions(self.inner.qp.cq_index, usize::MAX);
            }
            let st = lock(&self.inner.state);
            if st.state == ConnState::Down {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = if drive {
                (deadline - now).min(Duration::from_millis(1))
            } else {
                deadline - now
            };
            let (st, _) = self
                .inner
                .state_cv
                .wait_timeout(st, wait)
                .unwrap_or_else(|e| e.into_inner());
            if st.state == ConnState::Down {
                return true;
            }
        }
    }

    /// Teardown-thread side of an asynchronous disconnect
    ///
    /// In polled mode the wait drives the connection's own completion queues.
    pub(crate) fn run_deferred_teardown(&self) {
        let down = self.begin_teardown();
        let config = &self.inner.shared.config;
        let timeout = config.teardown_timeout;
        let drive = config.completion_mode == CompletionMode::Polled;
        if !down && !self.wait_for_down(timeout, drive) {
            log::warn!(
                "Conn {}: not drained after {:?} ({} sends, {} receives outstanding)",
                self.inner.id,
                timeout,
                self.outstanding_sends(),
                self.outstanding_receives()
            );
        }
        if !lock(&self.inner.state).freeing {
            self.inner.shared.handler.connection_lost(self);
        }
    }

    // ------------------------------------------------------------------
    // Outstanding work accounting
    // ------------------------------------------------------------------

    fn reserve(&self, counter: &AtomicUsize, n: usize, what: &str) -> IsertResult<()> {
        let st = lock(&self.inner.state);
        if st.state >= ConnState::Terminating {
            return Err(IsertError::InvalidState(format!(
                "conn {} is {:?}, not posting {}",
                self.inner.id, st.state, what
            )));
        }
        counter.fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, counter: &AtomicUsize, n: usize, what: &str) {
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(n))
            .is_err()
        {
            log::error!("Conn {}: {} count underflow releasing {}", self.inner.id, what, n);
            self.inner.accounting_errors.fetch_add(1, Ordering::AcqRel);
            counter.store(0, Ordering::Release);
        }
    }

    pub(crate) fn reserve_sends(&self, n: usize) -> IsertResult<()> {
        self.reserve(&self.inner.post_send_count, n, "sends")
    }

    pub(crate) fn reserve_recvs(&self, n: usize) -> IsertResult<()> {
        self.reserve(&self.inner.post_recv_count, n, "receives")
    }

    /// Count the drain beacon, allowed while `Terminating`
    pub(crate) fn reserve_beacon(&self) -> bool {
        let st = lock(&self.inner.state);
        if st.state == ConnState::Down {
            return false;
        }
        self.inner.post_send_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn release_sends(&self, n: usize) {
        self.release(&self.inner.post_send_count, n, "send");
    }

    pub(crate) fn release_recvs(&self, n: usize) {
        self.release(&self.inner.post_recv_count, n, "receive");
    }
}

pub(crate) fn unknown_command(tag: CmdTag) -> IsertError {
    IsertError::InvalidState(format!("no command context for {:?}", tag))
}

// ============================================================================
// Unit Tests
// ============================================================================
