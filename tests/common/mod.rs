//! Shared fixtures for the integration tests
//!
//! Every test runs the transport on its own `SoftRdma` provider and plays
//! the initiator by hand: connect, deliver PDUs into posted receives, run
//! the target's queued sends and drain the completion queues.

#![allow(dead_code)]

use iser_target::proto::{opcode, BHS_SIZE};
use iser_target::soft::SoftRdma;
use iser_target::verbs::{AdapterId, DeviceAttr};
use iser_target::{
    BuiltPdu, CmdTag, CompletionMode, ConnState, Connection, ConnectionId, IserHeader,
    IsertError, IsertResult, IsertTransport, Listener, LoginResponse, PduHandler, ResponseState,
    RxPdu, TransportConfig, Verbs,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

// ============================================================================
// Test Configuration
// ============================================================================

#[derive(Debug)]
struct TestSettings {
    portal: SocketAddr,
    config: TransportConfig,
}

static SETTINGS: Lazy<TestSettings> = Lazy::new(|| {
    let contents = std::fs::read_to_string("test-config.toml")
        .expect("Failed to read test-config.toml - config file required");
    let value = contents
        .parse::<toml::Value>()
        .expect("Failed to parse test-config.toml - invalid TOML syntax");

    let listener = value.get("listener").expect("Missing [listener] section");
    let portal = match env::var("ISER_TEST_PORTAL") {
        Ok(addr) => addr,
        Err(_) => listener
            .get("portal")
            .and_then(|p| p.as_str())
            .expect("Missing or invalid 'portal' in [listener] section")
            .to_string(),
    };
    let portal = portal.parse().expect("portal is not a socket address");

    let transport = value.get("transport").expect("Missing [transport] section");
    let int = |key: &str| -> u64 {
        transport
            .get(key)
            .and_then(|v| v.as_integer())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [transport] section", key))
            as u64
    };
    let mut config = TransportConfig::new()
        .with_recv_ring_size(int("recv_ring_size") as usize)
        .with_rx_low_water(int("rx_low_water") as usize)
        .with_comp_batch_count(int("comp_batch_count") as usize)
        .with_fastreg_pool_size(int("fastreg_pool_size") as usize)
        .with_max_fastreg_pages(int("max_fastreg_pages") as usize)
        .with_max_commands(int("max_commands") as usize)
        .with_max_recv_data_segment_length(int("max_recv_data_segment_length") as usize)
        .with_max_login_response_size(int("max_login_response_size") as usize)
        .with_accept_timeout(Duration::from_millis(int("accept_timeout_ms")))
        .with_login_timeout(Duration::from_millis(int("login_timeout_ms")))
        .with_teardown_timeout(Duration::from_millis(int("teardown_timeout_ms")))
        .with_completion_mode(CompletionMode::Polled);
    config.accept_retries = int("accept_retries") as usize;

    TestSettings { portal, config }
});

pub const ADAPTER: AdapterId = 0x0002_c903_0000_00aa;
/// Second adapter, with its own device and completion queues
pub const ADAPTER_B: AdapterId = 0x0002_c903_0000_00bb;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn portal() -> SocketAddr {
    SETTINGS.portal
}

/// Polled-mode configuration from test-config.toml
pub fn test_config() -> TransportConfig {
    SETTINGS.config.clone()
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// PDU helpers
// ============================================================================

pub fn bhs(op: u8, itt: u32, data_len: usize) -> [u8; BHS_SIZE] {
    let mut bhs = [0u8; BHS_SIZE];
    bhs[0] = op;
    bhs[1] = 0x80;
    let len = data_len as u32;
    bhs[5] = (len >> 16) as u8;
    bhs[6] = (len >> 8) as u8;
    bhs[7] = len as u8;
    bhs[16..20].copy_from_slice(&itt.to_be_bytes());
    bhs
}

/// Transport header, BHS and data segment as the initiator sends them
pub fn pdu_bytes(header: &IserHeader, op: u8, itt: u32, data: &[u8]) -> Vec<u8> {
    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(&bhs(op, itt, data.len()));
    bytes.extend_from_slice(data);
    bytes
}

/// Header advertising an initiator buffer for Data-In
pub fn read_header(stag: u32, va: u64) -> IserHeader {
    IserHeader {
        flags: iser_target::proto::iser_flags::ISCSI_CTRL | iser_target::proto::iser_flags::RSV,
        read_stag: stag,
        read_va: va,
        ..Default::default()
    }
}

/// Header advertising an initiator buffer holding Data-Out
pub fn write_header(stag: u32, va: u64) -> IserHeader {
    IserHeader {
        flags: iser_target::proto::iser_flags::ISCSI_CTRL | iser_target::proto::iser_flags::WSV,
        write_stag: stag,
        write_va: va,
        ..Default::default()
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// ============================================================================
// Recording upper layer
// ============================================================================

/// A PDU as the upper layer saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub opcode: u8,
    pub itt: u32,
    pub immediate: bool,
    pub cmd: Option<CmdTag>,
    pub data: Vec<u8>,
}

/// Upper layer that records every callback
#[derive(Default)]
pub struct RecordingTarget {
    received: Mutex<Vec<Received>>,
    executed: Mutex<Vec<CmdTag>>,
    released: Mutex<Vec<CmdTag>>,
    control: Mutex<Vec<(CmdTag, ResponseState)>>,
    lost: Mutex<Vec<ConnectionId>>,
    states: Mutex<Vec<(ConnectionId, ConnState, ConnState)>>,
    /// Initiator task tags whose PDUs are refused
    refuse: Mutex<HashSet<u32>>,
    /// Sense data returned with a Status response, by task tag
    sense: Mutex<HashMap<u32, Vec<u8>>>,
    /// How long `connection_lost` takes
    lost_delay: Mutex<Duration>,
    /// Provider whose completion queues are sampled on every move to `Down`
    watched: Mutex<Option<Weak<SoftRdma>>>,
    queued_at_down: Mutex<Vec<usize>>,
}

pub const TEXT_RESPONSE_DATA: &[u8] = b"MaxRecvDataSegmentLength=8192";

impl RecordingTarget {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn tag_for(&self, itt: u32) -> Option<CmdTag> {
        self.received.lock().unwrap().iter().rev().find(|r| r.itt == itt).and_then(|r| r.cmd)
    }

    pub fn executed(&self) -> Vec<CmdTag> {
        self.executed.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<CmdTag> {
        self.released.lock().unwrap().clone()
    }

    pub fn control(&self) -> Vec<(CmdTag, ResponseState)> {
        self.control.lock().unwrap().clone()
    }

    pub fn lost(&self) -> Vec<ConnectionId> {
        self.lost.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<(ConnectionId, ConnState, ConnState)> {
        self.states.lock().unwrap().clone()
    }

    pub fn refuse_itt(&self, itt: u32) {
        self.refuse.lock().unwrap().insert(itt);
    }

    pub fn set_sense(&self, itt: u32, sense: &[u8]) {
        self.sense.lock().unwrap().insert(itt, sense.to_vec());
    }

    /// Record the provider's queued completions whenever a connection goes down
    pub fn watch_down(&self, soft: &Arc<SoftRdma>) {
        *self.watched.lock().unwrap() = Some(Arc::downgrade(soft));
    }

    pub fn queued_at_down(&self) -> Vec<usize> {
        self.queued_at_down.lock().unwrap().clone()
    }

    /// Make every later `connection_lost` callback block for `delay`
    pub fn slow_lost(&self, delay: Duration) {
        *self.lost_delay.lock().unwrap() = delay;
    }
}

impl PduHandler for RecordingTarget {
    fn handle_pdu(&self, _conn: &Connection, pdu: RxPdu<'_>) -> IsertResult<()> {
        self.received.lock().unwrap().push(Received {
            opcode: pdu.bhs.opcode,
            itt: pdu.bhs.itt,
            immediate: pdu.bhs.immediate,
            cmd: pdu.cmd,
            data: pdu.data.to_vec(),
        });
        if self.refuse.lock().unwrap().contains(&pdu.bhs.itt) {
            return Err(IsertError::Protocol(format!("refusing itt {:#x}", pdu.bhs.itt)));
        }
        Ok(())
    }

    fn build_pdu(&self, conn: &Connection, cmd: CmdTag, state: ResponseState) -> IsertResult<BuiltPdu> {
        let info = conn
            .command_info(cmd)
            .ok_or_else(|| IsertError::InvalidState(format!("no command {:?}", cmd)))?;
        let (op, data) = match state {
            ResponseState::Status => (
                opcode::SCSI_RESPONSE,
                self.sense.lock().unwrap().get(&info.itt).cloned().unwrap_or_default(),
            ),
            ResponseState::NopIn => (opcode::NOP_IN, Vec::new()),
            ResponseState::TaskMgmtResponse => (opcode::TASK_MANAGEMENT_RESPONSE, Vec::new()),
            ResponseState::Reject => (opcode::REJECT, vec![0u8; BHS_SIZE]),
            ResponseState::TextResponse => (opcode::TEXT_RESPONSE, TEXT_RESPONSE_DATA.to_vec()),
            ResponseState::LogoutResponse => (opcode::LOGOUT_RESPONSE, Vec::new()),
        };
        Ok(BuiltPdu { bhs: bhs(op, info.itt, data.len()), data })
    }

    fn execute(&self, _conn: &Connection, cmd: CmdTag) {
        self.executed.lock().unwrap().push(cmd);
    }

    fn control_complete(&self, _conn: &Connection, cmd: CmdTag, state: ResponseState) {
        self.control.lock().unwrap().push((cmd, state));
    }

    fn release_command(&self, _conn: &Connection, cmd: CmdTag) {
        self.released.lock().unwrap().push(cmd);
    }

    fn connection_lost(&self, conn: &Connection) {
        let delay = *self.lost_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.lost.lock().unwrap().push(conn.id());
    }

    fn state_changed(&self, conn: ConnectionId, from: ConnState, to: ConnState) {
        if to == ConnState::Down {
            let soft = self.watched.lock().unwrap().as_ref().and_then(Weak::upgrade);
            if let Some(soft) = soft {
                self.queued_at_down.lock().unwrap().push(soft.queued_completions());
            }
        }
        self.states.lock().unwrap().push((conn, from, to));
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub soft: Arc<SoftRdma>,
    pub target: Arc<RecordingTarget>,
    pub transport: IsertTransport,
    pub listener: Listener,
}

impl Fixture {
    pub fn new(attr: DeviceAttr, config: TransportConfig) -> Self {
        init_logging();
        let soft = Arc::new(SoftRdma::new());
        soft.add_adapter(ADAPTER, attr.clone());
        soft.add_adapter(ADAPTER_B, attr);
        let target = Arc::new(RecordingTarget::default());
        let verbs: Arc<dyn Verbs> = soft.clone();
        let handler: Arc<dyn PduHandler> = target.clone();
        let transport = IsertTransport::builder()
            .config(config)
            .build(verbs, handler)
            .expect("Failed to build transport");
        let listener = transport.setup_listener(portal()).expect("Failed to listen");
        Fixture { soft, target, transport, listener }
    }

    /// Adapter without fast registration
    pub fn direct() -> Self {
        Self::new(SoftRdma::direct_attr(), test_config())
    }

    pub fn fast_reg() -> Self {
        Self::new(SoftRdma::fast_reg_attr(), test_config())
    }

    /// Initiator connects, target accepts
    pub fn connect(&self) -> Connection {
        self.connect_on(ADAPTER)
    }

    /// Connect through a particular local adapter
    pub fn connect_on(&self, adapter: AdapterId) -> Connection {
        let id = self.soft.connect(self.listener.addr(), adapter).expect("connect");
        let conn = self.transport.accept(&self.listener).expect("accept");
        assert_eq!(conn.cm_id(), id);
        conn
    }

    pub fn poll(&self, conn: &Connection) -> usize {
        self.transport.poll(conn, usize::MAX)
    }

    /// Run the target's queued sends, then reap their completions
    pub fn process(&self, conn: &Connection) -> usize {
        let ran = self.soft.process_sends(conn.qp_num());
        self.poll(conn);
        ran
    }

    pub fn deliver(&self, conn: &Connection, bytes: &[u8]) {
        self.soft.deliver(conn.qp_num(), bytes).expect("deliver");
        self.poll(conn);
    }

    /// Single-step login to full feature phase
    pub fn login(&self, conn: &Connection) {
        self.deliver(
            conn,
            &pdu_bytes(&IserHeader::ctrl(), opcode::LOGIN_REQUEST, 0, b"InitiatorName=iqn.2024-01.test:init"),
        );
        let req = self.transport.get_login_rx(conn).expect("login request");
        let itt = u32::from_be_bytes([req.bhs[16], req.bhs[17], req.bhs[18], req.bhs[19]]);
        let rsp = LoginResponse {
            bhs: bhs(opcode::LOGIN_RESPONSE, itt, 0),
            data: Vec::new(),
            complete: true,
            failed: false,
        };
        self.transport.put_login_tx(conn, &rsp).expect("login response");
        self.process(conn);
        assert_eq!(conn.state(), ConnState::Up);
    }

    /// Connected and logged in
    pub fn up(&self) -> Connection {
        self.up_on(ADAPTER)
    }

    pub fn up_on(&self, adapter: AdapterId) -> Connection {
        let conn = self.connect_on(adapter);
        self.login(&conn);
        self.soft.take_sent(conn.qp_num());
        conn
    }

    /// Deliver a command PDU and return the context the transport made for it
    pub fn command(&self, conn: &Connection, header: &IserHeader, op: u8, itt: u32) -> CmdTag {
        self.deliver(conn, &pdu_bytes(header, op, itt, &[]));
        self.target.tag_for(itt).expect("command context")
    }

    pub fn scsi_command(&self, conn: &Connection, itt: u32) -> CmdTag {
        self.command(conn, &IserHeader::ctrl(), opcode::SCSI_COMMAND, itt)
    }
}
