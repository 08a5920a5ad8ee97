//! iSER transport instance and the operations the iSCSI layer calls
//!
//! The transport owns the device registry, the upper layer's
//! [`PduHandler`] and a deferred worker thread for work that must not run
//! on a completion worker. Control-response completions run on the deferred
//! worker itself. Each asynchronous disconnect gets its own teardown thread.

use crate::config::{CompletionMode, TransportConfig};
use crate::connection::{CmdTag, ConnState, ConnInner, Connection, ConnectionId};
use crate::device::DeviceRegistry;
use crate::error::{IsertError, IsertResult};
use crate::handler::{LoginPdu, LoginResponse, PduHandler, ResponseState};
use crate::verbs::{lock, CmEvent, CmEventHandler, CmId, Verbs};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};

/// Work handed to the deferred worker
pub(crate) enum DeferredWork {
    /// Disconnect, drain and report a connection lost underneath the session
    Disconnect(Connection),
    /// A control response was sent
    ControlComplete { conn: Connection, tag: CmdTag, state: ResponseState },
    Shutdown,
}

/// State shared by the transport, its listeners and connections
pub(crate) struct Shared {
    pub(crate) verbs: Arc<dyn Verbs>,
    pub(crate) config: TransportConfig,
    pub(crate) handler: Arc<dyn PduHandler>,
    pub(crate) registry: DeviceRegistry,
    deferred: Sender<DeferredWork>,
    next_conn_id: AtomicU64,
}

impl Shared {
    pub(crate) fn defer(&self, work: DeferredWork) {
        if self.deferred.send(work).is_err() {
            log::warn!("Deferred worker gone, dropping work");
        }
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn run_deferred(rx: Receiver<DeferredWork>) {
    log::debug!("Deferred worker started");
    let mut teardowns: Vec<JoinHandle<()>> = Vec::new();
    for work in rx {
        teardowns.retain(|handle| !handle.is_finished());
        match work {
            DeferredWork::Disconnect(conn) => {
                if let Some(handle) = spawn_teardown(conn) {
                    teardowns.push(handle);
                }
            }
            DeferredWork::ControlComplete { conn, tag, state } => {
                log::debug!("Conn {}: {:?} sent for {:?}", conn.id(), state, tag);
                conn.shared().handler.control_complete(&conn, tag, state);
                conn.release_cmd(tag);
            }
            DeferredWork::Shutdown => break,
        }
    }
    if !teardowns.is_empty() {
        log::debug!("Waiting for {} connection teardowns", teardowns.len());
    }
    for handle in teardowns {
        let _ = handle.join();
    }
    log::debug!("Deferred worker stopped");
}

/// Drain and report one lost connection on a thread of its own
fn spawn_teardown(conn: Connection) -> Option<JoinHandle<()>> {
    let id = conn.id();
    let fallback = conn.clone();
    match thread::Builder::new()
        .name(format!("isert-teardown-{}", id))
        .spawn(move || conn.run_deferred_teardown())
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::error!("Conn {}: cannot start teardown thread ({}), tearing down inline", id, e);
            fallback.run_deferred_teardown();
            None
        }
    }
}

/// iSER target transport
pub struct IsertTransport {
    shared: Arc<Shared>,
    deferred_worker: Option<JoinHandle<()>>,
}

impl IsertTransport {
    /// Create a new builder for configuring the transport
    pub fn builder() -> IsertTransportBuilder {
        IsertTransportBuilder::new()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    /// Bind and listen for iSER connect requests on `addr`
    pub fn setup_listener(&self, addr: SocketAddr) -> IsertResult<Listener> {
        let inner = Arc::new(ListenerInner {
            verbs: Arc::clone(&self.shared.verbs),
            addr,
            id: OnceLock::new(),
            accept: Mutex::new(AcceptQueue::default()),
            accept_cv: Condvar::new(),
        });
        let handler: CmEventHandler = {
            let shared = Arc::downgrade(&self.shared);
            let listener = Arc::downgrade(&inner);
            Arc::new(move |event| {
                if let (Some(shared), Some(listener)) = (shared.upgrade(), listener.upgrade()) {
                    handle_cm_event(&shared, &listener, event);
                }
            })
        };
        let id = self.shared.verbs.listen(addr, self.shared.config.listen_backlog, handler)?;
        let _ = inner.id.set(id);
        log::info!("iSER listener on {} ({:?})", addr, id);
        Ok(Listener { inner })
    }

    /// Wait for a connection request and accept it
    ///
    /// Waits up to `accept_timeout` per wake-up and gives up after
    /// `accept_retries` wake-ups without a queued connection, or at once when
    /// the listener is freed.
    pub fn accept(&self, listener: &Listener) -> IsertResult<Connection> {
        let config = &self.shared.config;
        let conn = {
            let mut queue = lock(&listener.inner.accept);
            let mut wakeups = 0;
            loop {
                if queue.reset {
                    return Err(IsertError::InvalidState("listener has been freed".to_string()));
                }
                if let Some(conn) = queue.pending.pop_front() {
                    break conn;
                }
                if wakeups >= config.accept_retries {
                    return Err(IsertError::Timeout(format!(
                        "no connection request on {} after {} waits",
                        listener.inner.addr, wakeups
                    )));
                }
                queue = listener
                    .inner
                    .accept_cv
                    .wait_timeout(queue, config.accept_timeout)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
                wakeups += 1;
            }
        };

        conn.post_login_recv()?;
        self.shared.verbs.accept(conn.cm_id(), &conn.conn_param())?;
        log::info!(
            "Conn {}: accepted from {:?} (initiator depth {}, responder resources {})",
            conn.id(),
            conn.peer_addr(),
            conn.conn_param().initiator_depth,
            conn.conn_param().responder_resources
        );
        Ok(conn)
    }

    /// Stop listening; blocked and later `accept` calls fail
    pub fn free_listener(&self, listener: &Listener) {
        listener.inner.close();
    }

    /// Tear a connection down and wait for its outstanding work to drain
    ///
    /// Resources are released once the last handle goes away, even when the
    /// drain times out.
    pub fn free_connection(&self, conn: Connection) -> IsertResult<()> {
        lock(&conn.inner.state).freeing = true;
        let down = conn.begin_teardown();
        let timeout = self.shared.config.teardown_timeout;
        let drive = self.shared.config.completion_mode == CompletionMode::Polled;
        if down || conn.wait_for_down(timeout, drive) {
            log::info!("Conn {}: freed", conn.id());
            Ok(())
        } else {
            log::warn!(
                "Conn {}: freeing with {} sends and {} receives outstanding",
                conn.id(),
                conn.outstanding_sends(),
                conn.outstanding_receives()
            );
            Err(IsertError::Timeout(format!(
                "conn {} did not drain within {:?}",
                conn.id(),
                timeout
            )))
        }
    }

    /// Next login request, waiting up to `login_timeout`
    pub fn get_login_rx(&self, conn: &Connection) -> IsertResult<LoginPdu> {
        match conn.inner.login_rx.recv_timeout(self.shared.config.login_timeout) {
            Ok(pdu) => Ok(pdu),
            Err(RecvTimeoutError::Timeout) if conn.state() >= ConnState::Terminating => Err(
                IsertError::InvalidState(format!("conn {} is {:?}", conn.id(), conn.state())),
            ),
            Err(RecvTimeoutError::Timeout) => {
                Err(IsertError::Timeout(format!("no login request on conn {}", conn.id())))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(IsertError::InvalidState("login queue closed".to_string()))
            }
        }
    }

    pub fn put_login_tx(&self, conn: &Connection, rsp: &LoginResponse) -> IsertResult<()> {
        conn.put_login_tx(rsp)
    }

    /// Send a NOP-In ahead of the normal response flow
    pub fn queue_immediate(&self, conn: &Connection, tag: CmdTag, state: ResponseState) -> IsertResult<()> {
        conn.queue_immediate(tag, state)
    }

    pub fn queue_response(&self, conn: &Connection, tag: CmdTag, state: ResponseState) -> IsertResult<()> {
        conn.queue_response(tag, state)
    }

    /// Fetch a command's Data-Out with RDMA Read; `PduHandler::execute` runs
    /// once it has arrived
    pub fn get_dataout(&self, conn: &Connection, tag: CmdTag) -> IsertResult<()> {
        conn.read_data_out(tag)
    }

    /// Send a command's read data with RDMA Write, followed by its status
    pub fn queue_data_in(&self, conn: &Connection, tag: CmdTag) -> IsertResult<()> {
        conn.write_data_in(tag)
    }

    /// Drain a connection's completion queues (polled mode)
    pub fn poll(&self, conn: &Connection, budget: usize) -> usize {
        conn.device().poll_completions(conn.cq_index(), budget)
    }
}

impl Drop for IsertTransport {
    fn drop(&mut self) {
        self.shared.defer(DeferredWork::Shutdown);
        if let Some(handle) = self.deferred_worker.take() {
            let _ = handle.join();
        }
    }
}

/// Builder for configuring an iSER transport
pub struct IsertTransportBuilder {
    config: Option<TransportConfig>,
    completion_mode: Option<CompletionMode>,
}

impl IsertTransportBuilder {
    fn new() -> Self {
        Self { config: None, completion_mode: None }
    }

    /// Set the transport tunables (default: `TransportConfig::default()`)
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override how completion queues are drained
    pub fn completion_mode(mut self, mode: CompletionMode) -> Self {
        self.completion_mode = Some(mode);
        self
    }

    /// Build the transport on a verbs provider
    pub fn build(self, verbs: Arc<dyn Verbs>, handler: Arc<dyn PduHandler>) -> IsertResult<IsertTransport> {
        let mut config = self.config.unwrap_or_default();
        if let Some(mode) = self.completion_mode {
            config.completion_mode = mode;
        }
        config.validate()?;

        let (tx, rx) = crossbeam::channel::unbounded();
        let deferred_worker = thread::Builder::new()
            .name("isert-deferred".to_string())
            .spawn(move || run_deferred(rx))?;
        log::info!(
            "iSER transport ready: ring {}, low water {}, batch {}, {:?} completions",
            config.recv_ring_size,
            config.rx_low_water,
            config.comp_batch_count,
            config.completion_mode
        );
        let shared = Arc::new(Shared {
            registry: DeviceRegistry::new(Arc::clone(&verbs), config.clone()),
            verbs,
            config,
            handler,
            deferred: tx,
            next_conn_id: AtomicU64::new(1),
        });
        Ok(IsertTransport { shared, deferred_worker: Some(deferred_worker) })
    }
}

/// Listening endpoint
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn cm_id(&self) -> Option<CmId> {
        self.inner.id.get().copied()
    }

    /// Connections waiting for `accept`
    pub fn pending(&self) -> usize {
        lock(&self.inner.accept).pending.len()
    }
}

struct ListenerInner {
    verbs: Arc<dyn Verbs>,
    addr: SocketAddr,
    id: OnceLock<CmId>,
    accept: Mutex<AcceptQueue>,
    accept_cv: Condvar,
}

#[derive(Default)]
struct AcceptQueue {
    pending: VecDeque<Connection>,
    /// Connections created on this listener, for routing their events
    conns: HashMap<CmId, Weak<ConnInner>>,
    reset: bool,
}

impl ListenerInner {
    fn close(&self) {
        let pending = {
            let mut queue = lock(&self.accept);
            if queue.reset {
                return;
            }
            queue.reset = true;
            self.accept_cv.notify_all();
            std::mem::take(&mut queue.pending)
        };
        if let Some(id) = self.id.get() {
            self.verbs.destroy_id(*id);
        }
        log::info!("Listener on {} closed, {} unaccepted connections dropped", self.addr, pending.len());
    }

    fn connection(&self, id: CmId) -> Option<Connection> {
        lock(&self.accept)
            .conns
            .get(&id)
            .and_then(Weak::upgrade)
            .map(Connection::from_inner)
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.close();
    }
}

fn handle_cm_event(shared: &Arc<Shared>, listener: &ListenerInner, event: CmEvent) {
    log::debug!("CM event {:?}", event);
    match event {
        CmEvent::ConnectRequest { id, adapter, initiator_depth, responder_resources } => {
            if lock(&listener.accept).reset {
                log::warn!("Connect request {:?} on closed listener", id);
                shared.verbs.destroy_id(id);
                return;
            }
            match Connection::create(shared, id, adapter, initiator_depth, responder_resources) {
                Ok(conn) => {
                    let mut queue = lock(&listener.accept);
                    queue.conns.retain(|_, w| w.strong_count() > 0);
                    queue.conns.insert(id, Arc::downgrade(&conn.inner));
                    queue.pending.push_back(conn);
                    listener.accept_cv.notify_all();
                }
                Err(e) => log::error!("Connect request {:?} on adapter {:#x} failed: {}", id, adapter, e),
            }
        }
        CmEvent::Established { id } => match listener.connection(id) {
            Some(conn) => log::info!("Conn {}: established", conn.id()),
            None => log::debug!("Established for unknown {:?}", id),
        },
        CmEvent::Disconnected { id }
        | CmEvent::DeviceRemoval { id }
        | CmEvent::AddrChange { id }
        | CmEvent::ConnectError { id }
        | CmEvent::Rejected { id } => match listener.connection(id) {
            Some(conn) => {
                log::info!("Conn {}: {:?}, tearing down", conn.id(), event);
                conn.schedule_teardown();
            }
            None => log::debug!("{:?} for unknown connection", event),
        },
        CmEvent::TimewaitExit { id } => log::debug!("Timewait exit for {:?}", id),
    }
}
