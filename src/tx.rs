//! Transmit path
//!
//! Every response goes out as one send whose first scatter entry is the
//! 76 byte iSER + BHS header block and whose optional second entry is the
//! data segment.
//!
//! Status responses are coalesced: only every `comp_batch_count`-th one is
//! posted signaled, and it carries the unsignaled ones posted before it as
//! its batch. Posting happens under the coalescing lock, so the batch always
//! holds exactly the sends queued ahead of the signaled one, and the send
//! queue executes them in that order. When the signaled send completes its
//! batch is complete too. Unsignaled sends still pending at teardown are
//! resolved by the drain beacon, a zero-length signaled send posted after
//! the disconnect that can only complete once everything ahead of it has.

use crate::connection::{unknown_command, CmdOp, CmdTag, Connection, WrId};
use crate::device::{Device, DmaMapping};
use crate::error::{IsertError, IsertResult};
use crate::handler::{LoginResponse, ResponseState};
use crate::registration;
use crate::proto::{frame_sense_data, padded_len, IserHeader, BHS_SIZE, ISER_HDR_LEN, ISER_HEADERS_LEN};
use crate::transport::DeferredWork;
use crate::verbs::{lock, DmaDirection, HostBuffer, SendWr, Sge, WcStatus, WrOpcode};
use std::collections::{HashMap, VecDeque};

/// Mapped header block and optional data segment of one send
pub(crate) struct TxDesc {
    header: DmaMapping,
    payload: Option<DmaMapping>,
    /// Data segment living in a buffer owned elsewhere (login response)
    external: Option<Sge>,
}

impl TxDesc {
    pub(crate) fn new(
        device: &Device,
        iser: &IserHeader,
        bhs: &[u8; BHS_SIZE],
        payload: Option<Vec<u8>>,
    ) -> IsertResult<Self> {
        let mut block = vec![0u8; ISER_HEADERS_LEN];
        iser.write_to(&mut block)?;
        block[ISER_HDR_LEN..].copy_from_slice(bhs);
        let header = DmaMapping::map(device, HostBuffer::from_vec(block), DmaDirection::ToDevice)?;
        let payload = match payload {
            Some(data) if !data.is_empty() => Some(DmaMapping::map(
                device,
                HostBuffer::from_vec(data),
                DmaDirection::ToDevice,
            )?),
            _ => None,
        };
        Ok(TxDesc { header, payload, external: None })
    }

    fn sg_list(&self, lkey: u32) -> Vec<Sge> {
        let mut sg = vec![Sge { addr: self.header.addr, length: self.header.len as u32, lkey }];
        if let Some(payload) = &self.payload {
            sg.push(Sge { addr: payload.addr, length: payload.len as u32, lkey });
        }
        if let Some(external) = self.external {
            sg.push(external);
        }
        sg
    }

    fn sync_for_device(&self) {
        self.header.sync_for_device();
        if let Some(payload) = &self.payload {
            payload.sync_for_device();
        }
    }
}

/// Send completion coalescing state of a connection
#[derive(Default)]
pub(crate) struct Coalesce {
    /// Coalescable sends since the last signaled one
    count: usize,
    /// Unsignaled sends not yet attached to a signaled one, oldest first
    pending: VecDeque<CmdTag>,
    /// Signaled send -> unsignaled sends it completes
    batches: HashMap<CmdTag, Vec<CmdTag>>,
}

impl Coalesce {
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Connection {
    /// Post a command's work request chain, ending in its send
    ///
    /// The send is the last element of `chain`. With `coalesce` set it may be
    /// posted unsignaled; otherwise it is signaled and picks up the pending
    /// batch.
    pub(crate) fn post_cmd_send(&self, tag: CmdTag, mut chain: Vec<SendWr>, coalesce: bool) -> IsertResult<()> {
        self.reserve_sends(1)?;
        let batch_count = self.shared().config.comp_batch_count;
        let mut comp = lock(&self.inner.comp);
        let deferred = coalesce && {
            comp.count += 1;
            comp.count < batch_count
        };
        if !deferred {
            comp.count = 0;
        }
        if let Some(send) = chain.last_mut() {
            send.signaled = !deferred;
        }

        match self.verbs().post_send(self.inner.qp.qp, &chain) {
            Ok(()) => {
                if deferred {
                    comp.pending.push_back(tag);
                } else if !comp.pending.is_empty() {
                    let batch: Vec<CmdTag> = comp.pending.drain(..).collect();
                    log::trace!("Conn {}: {:?} completes {} queued sends", self.id(), tag, batch.len());
                    comp.batches.insert(tag, batch);
                }
                Ok(())
            }
            Err(e) => {
                if deferred {
                    comp.count -= 1;
                }
                drop(comp);
                self.release_sends(1);
                log::error!("Conn {}: post_send for {:?} failed: {}", self.id(), tag, e);
                Err(IsertError::PostFailed(e.to_string()))
            }
        }
    }

    /// Completion of a command's send or final RDMA Read
    pub(crate) fn on_send_complete(&self, tag: CmdTag, status: WcStatus) {
        let members = {
            let mut comp = lock(&self.inner.comp);
            // An unsignaled send only reports here when it failed or was
            // flushed; it completes on its own
            if let Some(pos) = comp.pending.iter().position(|t| *t == tag) {
                comp.pending.remove(pos);
            } else {
                for batch in comp.batches.values_mut() {
                    batch.retain(|t| *t != tag);
                }
            }
            comp.batches.remove(&tag).unwrap_or_default()
        };
        for member in members {
            self.complete_send(member, WcStatus::Success);
        }
        self.complete_send(tag, status);
    }

    /// The drain beacon completed; nothing it was queued behind is pending
    pub(crate) fn on_beacon_complete(&self) {
        let pending: Vec<CmdTag> = lock(&self.inner.comp).pending.drain(..).collect();
        log::debug!("Conn {}: drain beacon completed, {} sends resolved", self.id(), pending.len());
        self.release_sends(1);
        for tag in pending {
            self.complete_send(tag, WcStatus::WrFlushError);
        }
    }

    /// Post the drain beacon if unsignaled sends are waiting
    pub(crate) fn post_beacon(&self) {
        let comp = lock(&self.inner.comp);
        if comp.pending.is_empty() {
            return;
        }
        if !self.reserve_beacon() {
            return;
        }
        let beacon = SendWr {
            wr_id: WrId::Beacon.encode(),
            opcode: WrOpcode::Send,
            sg_list: Vec::new(),
            signaled: true,
        };
        match self.verbs().post_send(self.inner.qp.qp, &[beacon]) {
            Ok(()) => log::debug!("Conn {}: drain beacon posted behind {} sends", self.id(), comp.pending.len()),
            Err(e) => {
                // Nothing signaled follows the pending sends, resolve them now
                drop(comp);
                log::warn!("Conn {}: drain beacon post failed: {}", self.id(), e);
                let pending: Vec<CmdTag> = lock(&self.inner.comp).pending.drain(..).collect();
                self.release_sends(1);
                for tag in pending {
                    self.complete_send(tag, WcStatus::WrFlushError);
                }
            }
        }
    }

    /// Per-command completion, once its send is known to be done
    fn complete_send(&self, tag: CmdTag, status: WcStatus) {
        // A send resolved by its batch or the drain beacon may still report
        // its own flush afterwards; only the first completion counts
        let (op, state) = {
            let mut cmds = lock(&self.inner.cmds);
            match cmds.get_mut(tag) {
                Some(cmd) if cmd.op != CmdOp::Idle => {
                    let op = cmd.op;
                    if op == CmdOp::Send {
                        cmd.op = CmdOp::Idle;
                        cmd.tx = None;
                    }
                    (op, cmd.state)
                }
                _ => {
                    log::debug!("Conn {}: {:?} already completed ({:?})", self.id(), tag, status);
                    return;
                }
            }
        };
        self.release_sends(1);

        match op {
            CmdOp::RdmaRead => self.on_rdma_read_complete(tag, status),
            CmdOp::Send => match state {
                Some(state) if status.is_success() && state.is_control() => {
                    if state == ResponseState::LogoutResponse {
                        lock(&self.inner.state).logout_posted = true;
                    }
                    self.shared().defer(DeferredWork::ControlComplete { conn: self.clone(), tag, state });
                }
                _ => self.release_cmd(tag),
            },
            CmdOp::Idle => {}
        }
    }

    /// Build and queue a response PDU for a command
    pub(crate) fn queue_response(&self, tag: CmdTag, state: ResponseState) -> IsertResult<()> {
        let tx = self.build_response(tag, state)?;
        let send = self.stage_send(tag, state, tx)?;
        self.post_staged(tag, vec![send], state.coalesces())
    }

    /// Immediate queue: NOP-In only
    pub(crate) fn queue_immediate(&self, tag: CmdTag, state: ResponseState) -> IsertResult<()> {
        if state != ResponseState::NopIn {
            return Err(IsertError::InvalidState(format!(
                "unsupported immediate response {:?}",
                state
            )));
        }
        self.queue_response(tag, state)
    }

    /// Ask the upper layer for the PDU and map it for sending
    pub(crate) fn build_response(&self, tag: CmdTag, state: ResponseState) -> IsertResult<TxDesc> {
        let built = self.shared().handler.build_pdu(self, tag, state)?;
        let payload = if built.data.is_empty() {
            None
        } else if state == ResponseState::Status {
            Some(frame_sense_data(&built.data)?)
        } else {
            let mut data = built.data;
            data.resize(padded_len(data.len()), 0);
            Some(data)
        };
        TxDesc::new(&self.inner.device, &IserHeader::ctrl(), &built.bhs, payload)
    }

    /// Attach a send descriptor (and registration) to the command and build
    /// its send work request
    pub(crate) fn stage_send(
        &self,
        tag: CmdTag,
        state: ResponseState,
        tx: TxDesc,
    ) -> IsertResult<SendWr> {
        tx.sync_for_device();
        let send = SendWr {
            wr_id: WrId::Cmd(tag).encode(),
            opcode: WrOpcode::Send,
            sg_list: tx.sg_list(self.inner.device.dma_lkey()),
            signaled: false,
        };
        let mut cmds = lock(&self.inner.cmds);
        let cmd = cmds.get_mut(tag).ok_or_else(|| unknown_command(tag))?;
        if cmd.op != CmdOp::Idle {
            return Err(IsertError::InvalidState(format!("{:?} has work in flight", tag)));
        }
        cmd.op = CmdOp::Send;
        cmd.state = Some(state);
        cmd.tx = Some(tx);
        Ok(send)
    }

    /// Post a staged chain; on failure the command is returned to idle with
    /// its descriptors unmapped
    pub(crate) fn post_staged(&self, tag: CmdTag, chain: Vec<SendWr>, coalesce: bool) -> IsertResult<()> {
        let result = self.post_cmd_send(tag, chain, coalesce);
        if result.is_err() {
            let reg = {
                let mut cmds = lock(&self.inner.cmds);
                cmds.get_mut(tag).and_then(|cmd| {
                    cmd.op = CmdOp::Idle;
                    cmd.tx = None;
                    cmd.reg.take()
                })
            };
            if let Some(reg) = reg {
                registration::abandon(self.inner.fr_pool.as_ref(), reg, tag);
            }
        }
        result
    }

    /// Send a login response from the dedicated response buffer
    ///
    /// A final response moves the connection to `Up` and posts the first
    /// batch of ring receives; an intermediate one re-posts the login
    /// receive for the next request.
    pub(crate) fn put_login_tx(&self, rsp: &LoginResponse) -> IsertResult<()> {
        let buf = &self.inner.login.rsp;
        if rsp.data.len() > buf.len {
            return Err(IsertError::InvalidTransfer(format!(
                "login response of {} bytes exceeds {} byte buffer",
                rsp.data.len(),
                buf.len
            )));
        }
        buf.buf.write_at(0, &rsp.data)?;
        buf.sync_for_device();

        if !rsp.failed {
            if rsp.complete {
                self.alloc_rx_ring()?;
                self.post_receives(self.shared().config.rx_low_water)?;
                self.set_up()?;
            } else {
                self.post_login_recv()?;
            }
        }

        let mut tx = TxDesc::new(&self.inner.device, &IserHeader::ctrl(), &rsp.bhs, None)?;
        if !rsp.data.is_empty() {
            tx.external = Some(Sge {
                addr: buf.addr,
                length: rsp.data.len() as u32,
                lkey: self.inner.device.dma_lkey(),
            });
        }
        tx.sync_for_device();
        let send = SendWr {
            wr_id: WrId::LoginTx.encode(),
            opcode: WrOpcode::Send,
            sg_list: tx.sg_list(self.inner.device.dma_lkey()),
            signaled: true,
        };

        self.reserve_sends(1)?;
        let mut slot = lock(&self.inner.login_tx);
        *slot = Some(tx);
        if let Err(e) = self.verbs().post_send(self.inner.qp.qp, &[send]) {
            *slot = None;
            drop(slot);
            self.release_sends(1);
            log::error!("Conn {}: login response post failed: {}", self.id(), e);
            return Err(IsertError::PostFailed(e.to_string()));
        }
        log::debug!(
            "Conn {}: login response sent ({} bytes, complete {})",
            self.id(),
            rsp.data.len(),
            rsp.complete
        );
        Ok(())
    }

    pub(crate) fn on_login_send_complete(&self) {
        lock(&self.inner.login_tx).take();
        self.release_sends(1);
    }

    /// Unsignaled sends waiting for a signaled one
    pub fn pending_coalesced(&self) -> usize {
        lock(&self.inner.comp).pending_len()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
