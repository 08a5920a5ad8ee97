//! Receive path
//!
//! Login requests arrive on a dedicated buffer and are handed to the login
//! thread through a channel. After login, a ring of receive descriptors is
//! kept posted; each completion is parsed, dispatched by opcode and the ring
//! replenished once enough slots are free.

use crate::config::TransportConfig;
use crate::connection::{ConnState, Connection, WrId};
use crate::device::{Device, DmaMapping};
use crate::error::{IsertError, IsertResult};
use crate::handler::{LoginPdu, RxPdu};
use crate::proto::{opcode, Bhs, IserHeader, IserMsgKind, BHS_SIZE, ISER_HDR_LEN, ISER_HEADERS_LEN};
use crate::verbs::{lock, DmaDirection, HostBuffer, RecvWr, Sge};

/// Dedicated login request and response buffers
pub(crate) struct LoginBuffers {
    pub(crate) req: DmaMapping,
    pub(crate) rsp: DmaMapping,
}

impl LoginBuffers {
    pub(crate) fn new(device: &Device, config: &TransportConfig) -> IsertResult<Self> {
        let req = DmaMapping::map(
            device,
            HostBuffer::new(config.max_recv_data_segment_length),
            DmaDirection::FromDevice,
        )?;
        let rsp = DmaMapping::map(
            device,
            HostBuffer::new(config.max_login_response_size),
            DmaDirection::ToDevice,
        )?;
        Ok(LoginBuffers { req, rsp })
    }
}

/// Receive descriptors, posted round-robin from `head`
pub(crate) struct RxRing {
    descs: Vec<DmaMapping>,
    head: usize,
}

impl RxRing {
    pub(crate) fn new(device: &Device, config: &TransportConfig) -> IsertResult<Self> {
        let len = ISER_HEADERS_LEN + config.max_recv_data_segment_length;
        let mut descs = Vec::with_capacity(config.recv_ring_size);
        for _ in 0..config.recv_ring_size {
            // Already mapped descriptors unmap when `descs` drops
            descs.push(DmaMapping::map(device, HostBuffer::new(len), DmaDirection::FromDevice)?);
        }
        Ok(RxRing { descs, head: 0 })
    }

    pub(crate) fn len(&self) -> usize {
        self.descs.len()
    }
}

impl Connection {
    /// Post the login request buffer
    pub(crate) fn post_login_recv(&self) -> IsertResult<()> {
        let req = &self.inner.login.req;
        let wr = RecvWr {
            wr_id: WrId::LoginRx.encode(),
            sg_list: vec![Sge {
                addr: req.addr,
                length: req.len as u32,
                lkey: self.inner.device.dma_lkey(),
            }],
        };
        self.reserve_recvs(1)?;
        if let Err(e) = self.verbs().post_recv(self.inner.qp.qp, &[wr]) {
            self.release_recvs(1);
            log::error!("Conn {}: login receive post failed: {}", self.id(), e);
            return Err(IsertError::PostFailed(e.to_string()));
        }
        Ok(())
    }

    /// Allocate the receive ring on first use
    pub(crate) fn alloc_rx_ring(&self) -> IsertResult<()> {
        let mut ring = lock(&self.inner.rx_ring);
        if ring.is_none() {
            *ring = Some(RxRing::new(&self.inner.device, &self.shared().config)?);
            log::debug!("Conn {}: receive ring allocated", self.id());
        }
        Ok(())
    }

    /// Post `count` ring descriptors as one chain
    ///
    /// On failure the outstanding count is unwound and the ring head stays
    /// where it was.
    pub(crate) fn post_receives(&self, count: usize) -> IsertResult<()> {
        let mut guard = lock(&self.inner.rx_ring);
        let ring = guard
            .as_mut()
            .ok_or_else(|| IsertError::InvalidState("receive ring not allocated".to_string()))?;
        let mask = ring.descs.len() - 1;
        let lkey = self.inner.device.dma_lkey();
        let wrs: Vec<RecvWr> = (0..count)
            .map(|i| {
                let index = (ring.head + i) & mask;
                let desc = &ring.descs[index];
                RecvWr {
                    wr_id: WrId::Rx(index as u32).encode(),
                    sg_list: vec![Sge { addr: desc.addr, length: desc.len as u32, lkey }],
                }
            })
            .collect();

        self.reserve_recvs(count)?;
        match self.verbs().post_recv(self.inner.qp.qp, &wrs) {
            Ok(()) => {
                ring.head = (ring.head + count) & mask;
                log::debug!("Conn {}: posted {} receives, head {}", self.id(), count, ring.head);
                Ok(())
            }
            Err(e) => {
                self.release_recvs(count);
                log::error!("Conn {}: posting {} receives failed: {}", self.id(), count, e);
                Err(IsertError::PostFailed(e.to_string()))
            }
        }
    }

    /// Successful receive completion; `slot` is `None` for the login buffer
    pub(crate) fn on_receive_complete(&self, slot: Option<u32>, byte_len: u32) {
        let bytes = match slot {
            None => {
                let req = &self.inner.login.req;
                req.sync_for_cpu();
                received(req, byte_len)
            }
            Some(index) => {
                let ring = lock(&self.inner.rx_ring);
                let bytes = ring.as_ref().and_then(|r| r.descs.get(index as usize)).map(|desc| {
                    desc.sync_for_cpu();
                    received(desc, byte_len)
                });
                drop(ring);
                match bytes {
                    Some(bytes) => bytes,
                    None => {
                        log::warn!("Conn {}: completion for unknown receive slot {}", self.id(), index);
                        self.release_recvs(1);
                        return;
                    }
                }
            }
        };
        self.release_recvs(1);

        match slot {
            None => {
                self.handle_login_request(&bytes);
                self.inner.login.req.sync_for_device();
            }
            Some(index) => {
                self.handle_rx_pdu(&bytes);
                if let Some(desc) = lock(&self.inner.rx_ring).as_ref().and_then(|r| r.descs.get(index as usize)) {
                    desc.sync_for_device();
                }
                self.replenish();
            }
        }
    }

    /// Flushed or failed receive
    pub(crate) fn on_receive_error(&self) {
        self.release_recvs(1);
    }

    fn handle_login_request(&self, bytes: &[u8]) {
        if bytes.len() < ISER_HEADERS_LEN {
            log::warn!("Conn {}: short login request ({} bytes), dropping", self.id(), bytes.len());
            return;
        }
        let (header, bhs) = match parse_headers(bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Conn {}: dropping login request: {}", self.id(), e);
                return;
            }
        };
        let data = payload(bytes, &bhs);
        let mut raw = [0u8; BHS_SIZE];
        raw.copy_from_slice(&bytes[ISER_HDR_LEN..ISER_HEADERS_LEN]);
        log::debug!(
            "Conn {}: login request itt {:#x}, {} data bytes",
            self.id(),
            bhs.itt,
            data.len()
        );
        let pdu = LoginPdu { header, bhs: raw, data: data.to_vec() };
        if self.inner.login_queue.send(pdu).is_err() {
            log::warn!("Conn {}: login queue closed", self.id());
        }
    }

    fn handle_rx_pdu(&self, bytes: &[u8]) {
        if bytes.len() < ISER_HEADERS_LEN {
            log::warn!("Conn {}: short PDU ({} bytes), dropping", self.id(), bytes.len());
            return;
        }
        let (header, bhs) = match parse_headers(bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("Conn {}: dropping PDU: {}", self.id(), e);
                return;
            }
        };
        match header.kind() {
            IserMsgKind::IscsiCtrl => {}
            IserMsgKind::Hello | IserMsgKind::HelloReply => {
                log::info!("Conn {}: iSER hello message, ignoring", self.id());
                return;
            }
            IserMsgKind::Unknown(flags) => {
                log::warn!("Conn {}: unknown iSER flags {:#x}", self.id(), flags);
            }
        }

        let cmd = match bhs.opcode {
            opcode::SCSI_COMMAND
            | opcode::NOP_OUT
            | opcode::TASK_MANAGEMENT_REQUEST
            | opcode::LOGOUT_REQUEST
            | opcode::TEXT_REQUEST => match self.alloc_command(bhs.itt, bhs.opcode, header) {
                Ok(tag) => Some(tag),
                Err(e) => {
                    log::warn!("Conn {}: dropping opcode {:#x}: {}", self.id(), bhs.opcode, e);
                    return;
                }
            },
            opcode::SCSI_DATA_OUT => None,
            other => {
                log::warn!("Conn {}: dropping PDU with unknown opcode {:#x}", self.id(), other);
                return;
            }
        };
        log::trace!("Conn {}: opcode {:#x} itt {:#x} -> {:?}", self.id(), bhs.opcode, bhs.itt, cmd);

        let pdu = RxPdu {
            header,
            bhs,
            raw_bhs: &bytes[ISER_HDR_LEN..ISER_HEADERS_LEN],
            data: payload(bytes, &bhs),
            cmd,
        };
        if let Err(e) = self.shared().handler.handle_pdu(self, pdu) {
            log::warn!("Conn {}: opcode {:#x} not handled: {}", self.id(), bhs.opcode, e);
            if let Some(tag) = cmd {
                self.release_cmd(tag);
            }
        }
    }

    /// Top the ring back up once `rx_low_water` slots are free
    fn replenish(&self) {
        if self.state() != ConnState::Up {
            return;
        }
        let config = &self.shared().config;
        let ring = match lock(&self.inner.rx_ring).as_ref() {
            Some(ring) => ring.len(),
            None => return,
        };
        let outstanding = self.outstanding_receives();
        if outstanding + config.rx_low_water > ring {
            return;
        }
        let count = (ring - outstanding).min(config.rx_low_water);
        match self.post_receives(count) {
            Ok(()) => {}
            Err(IsertError::InvalidState(_)) => {
                log::debug!("Conn {}: not replenishing, connection going down", self.id());
            }
            Err(e) => log::error!("Conn {}: replenish failed: {}", self.id(), e),
        }
    }
}

/// Bytes the adapter placed in a receive buffer
fn received(desc: &DmaMapping, byte_len: u32) -> Vec<u8> {
    let mut bytes = desc.buf.to_vec();
    bytes.truncate((byte_len as usize).min(desc.len));
    bytes
}

fn parse_headers(bytes: &[u8]) -> IsertResult<(IserHeader, Bhs)> {
    let header = IserHeader::from_bytes(&bytes[..ISER_HDR_LEN])?;
    let bhs = Bhs::from_bytes(&bytes[ISER_HDR_LEN..ISER_HEADERS_LEN])?;
    Ok((header, bhs))
}

/// Data segment following the headers, bounded by what was received
fn payload<'a>(bytes: &'a [u8], bhs: &Bhs) -> &'a [u8] {
    let body = &bytes[ISER_HEADERS_LEN..];
    &body[..(bhs.data_length as usize).min(body.len())]
}

// ============================================================================
// Unit Tests
// ============================================================================
