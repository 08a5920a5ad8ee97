//! Completion-queue worker
//!
//! Each completion-queue pair is drained by exactly one worker. In event
//! mode that is a dedicated thread woken by the queue's notification; in
//! polled mode it is whoever calls `Device::poll_completions`. Either way
//! the pair's drain lock serializes draining.

use crate::connection::{Connection, WrId};
use crate::device::CqPair;
use crate::error::IsertResult;
use crate::verbs::{lock, CqHandle, WorkCompletion};
use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Messages to a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerMsg {
    /// A completion queue has new entries
    Notify,
    Shutdown,
}

pub(crate) struct CqWorker {
    tx: Sender<WorkerMsg>,
    handle: Option<JoinHandle<()>>,
}

impl CqWorker {
    pub(crate) fn spawn(
        pair: Arc<CqPair>,
        tx: Sender<WorkerMsg>,
        rx: Receiver<WorkerMsg>,
    ) -> IsertResult<Self> {
        let handle = thread::Builder::new()
            .name(format!("isert-cq{}", pair.index))
            .spawn(move || run(pair, rx))?;
        Ok(CqWorker { tx, handle: Some(handle) })
    }

    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.tx.send(WorkerMsg::Shutdown);
        // The last device reference can drop on the worker itself
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
}

impl Drop for CqWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(pair: Arc<CqPair>, rx: Receiver<WorkerMsg>) {
    log::debug!("CQ worker {} started", pair.index);
    // Pick up anything that completed before the first notification
    pair.drain(usize::MAX);
    for msg in rx {
        match msg {
            WorkerMsg::Notify => {
                pair.drain(usize::MAX);
            }
            WorkerMsg::Shutdown => break,
        }
    }
    log::debug!("CQ worker {} stopped", pair.index);
}

impl CqPair {
    /// Poll both queues until empty or `budget` completions were handled,
    /// re-arming notifications once the queues run dry
    pub(crate) fn drain(&self, budget: usize) -> usize {
        let _drainer = lock(&self.drain_lock);
        let mut handled = self.poll_batch(budget);
        while handled < budget {
            self.arm(self.tx_cq);
            self.arm(self.rx_cq);
            // Entries that landed between the last poll and the re-arm
            let late = self.poll_batch(budget - handled);
            if late == 0 {
                break;
            }
            handled += late;
        }
        handled
    }

    fn poll_batch(&self, budget: usize) -> usize {
        let mut handled = 0;
        for cq in [self.tx_cq, self.rx_cq] {
            while handled < budget {
                let Some(wc) = self.verbs.poll_cq(cq) else {
                    break;
                };
                handled += 1;
                self.dispatch(&wc);
            }
        }
        handled
    }

    fn arm(&self, cq: CqHandle) {
        if let Err(e) = self.verbs.req_notify_cq(cq) {
            log::error!("Failed to arm CQ {:?}: {}", cq, e);
        }
    }

    fn dispatch(&self, wc: &WorkCompletion) {
        let conn = self
            .qps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&wc.qp_num)
            .and_then(|w| w.upgrade());
        match conn {
            Some(inner) => dispatch_completion(&Connection::from_inner(inner), wc),
            None => log::debug!(
                "Completion for unknown QP {:?} (wr_id {:#x}, {:?})",
                wc.qp_num,
                wc.wr_id,
                wc.status
            ),
        }
    }
}

/// Route one completion to the connection's handlers
pub(crate) fn dispatch_completion(conn: &Connection, wc: &WorkCompletion) {
    let Some(wr) = WrId::decode(wc.wr_id) else {
        log::warn!("Conn {}: completion with unknown wr_id {:#x}", conn.id(), wc.wr_id);
        return;
    };

    if !wc.status.is_success() {
        if wc.status.is_flush() {
            log::debug!("Conn {}: flushed {:?}", conn.id(), wr);
        } else {
            log::error!(
                "Conn {}: {:?} completed with {:?} (vendor_err {:#x})",
                conn.id(),
                wr,
                wc.status,
                wc.vendor_err
            );
        }
    }

    match wr {
        WrId::Rx(index) => {
            if wc.status.is_success() {
                conn.on_receive_complete(Some(index), wc.byte_len);
            } else {
                conn.on_receive_error();
            }
        }
        WrId::LoginRx => {
            if wc.status.is_success() {
                conn.on_receive_complete(None, wc.byte_len);
            } else {
                conn.on_receive_error();
            }
        }
        WrId::LoginTx => conn.on_login_send_complete(),
        WrId::Cmd(tag) => conn.on_send_complete(tag, wc.status),
        WrId::Beacon => conn.on_beacon_complete(),
        WrId::Reg(tag) | WrId::Rdma(tag) => {
            // Unsignaled, so only failures surface; the command's own send
            // or read completion does the cleanup
            log::debug!("Conn {}: {:?} for {:?}", conn.id(), wc.status, tag);
        }
    }

    if !wc.status.is_success() && !wc.status.is_flush() {
        conn.force_terminating();
    }
    conn.check_drained();
}
