//! RDMA data movement
//!
//! Data-In is pushed with RDMA Write into the buffer the initiator advertised
//! with its read STag, chained ahead of the SCSI response send. Data-Out is
//! pulled with RDMA Read from the buffer behind the write STag; the last read
//! is signaled and its completion hands the command back for execution.

use crate::connection::{unknown_command, CmdOp, CmdTag, Connection, WrId};
use crate::error::{IsertError, IsertResult};
use crate::handler::ResponseState;
use crate::registration::{self, RdmaDir, RegRequest};
use crate::verbs::{lock, HostBuffer, WcStatus};

/// What a transfer needs from the command context
struct TransferPlan {
    sg: Vec<HostBuffer>,
    offset: u32,
    length: u32,
    remote: (u32, u64),
}

impl Connection {
    fn plan_transfer(&self, tag: CmdTag, dir: RdmaDir) -> IsertResult<TransferPlan> {
        let cmds = lock(&self.inner.cmds);
        let cmd = cmds.get(tag).ok_or_else(|| unknown_command(tag))?;
        if cmd.op != CmdOp::Idle {
            return Err(IsertError::InvalidState(format!("{:?} has work in flight", tag)));
        }
        let data = cmd
            .data
            .as_ref()
            .ok_or_else(|| IsertError::InvalidTransfer(format!("{:?} has no data buffer", tag)))?;
        let (remote, offset) = match dir {
            RdmaDir::Write => (cmd.header.read_target(), 0),
            RdmaDir::Read => (cmd.header.write_target(), cmd.write_data_done),
        };
        let remote = remote.ok_or_else(|| {
            IsertError::Protocol(format!("{:?}: initiator advertised no buffer for {:?}", tag, dir))
        })?;
        let length = data.length.checked_sub(offset).filter(|n| *n > 0).ok_or_else(|| {
            IsertError::InvalidTransfer(format!(
                "{:?}: nothing left to transfer ({} of {} done)",
                tag, offset, data.length
            ))
        })?;
        Ok(TransferPlan { sg: data.sg.clone(), offset, length, remote })
    }

    /// Push read data to the initiator, followed by the SCSI response
    pub(crate) fn write_data_in(&self, tag: CmdTag) -> IsertResult<()> {
        let plan = self.plan_transfer(tag, RdmaDir::Write)?;
        let pool = self.inner.fr_pool.as_ref();
        let reg = registration::register(
            &self.inner.device,
            pool,
            &self.shared().config,
            &RegRequest {
                tag,
                sg: &plan.sg,
                dir: RdmaDir::Write,
                offset: plan.offset,
                length: plan.length,
                remote_stag: plan.remote.0,
                remote_va: plan.remote.1,
            },
        )?;

        let tx = match self.build_response(tag, ResponseState::Status) {
            Ok(tx) => tx,
            Err(e) => {
                registration::abandon(pool, reg, tag);
                return Err(e);
            }
        };
        let mut chain = reg.wrs.clone();
        let send = match self.stage_send(tag, ResponseState::Status, tx) {
            Ok(send) => send,
            Err(e) => {
                registration::abandon(pool, reg, tag);
                return Err(e);
            }
        };
        log::debug!(
            "Conn {}: {:?} RDMA Write {} bytes to stag {:#x} in {} work requests",
            self.id(),
            tag,
            plan.length,
            plan.remote.0,
            chain.len()
        );
        chain.push(send);
        let orphan = match lock(&self.inner.cmds).get_mut(tag) {
            Some(cmd) => {
                cmd.reg = Some(reg);
                None
            }
            None => Some(reg),
        };
        if let Some(reg) = orphan {
            registration::abandon(pool, reg, tag);
            return Err(unknown_command(tag));
        }
        self.post_staged(tag, chain, true)
    }

    /// Pull the remaining Data-Out from the initiator
    pub(crate) fn read_data_out(&self, tag: CmdTag) -> IsertResult<()> {
        let plan = self.plan_transfer(tag, RdmaDir::Read)?;
        let pool = self.inner.fr_pool.as_ref();
        let reg = registration::register(
            &self.inner.device,
            pool,
            &self.shared().config,
            &RegRequest {
                tag,
                sg: &plan.sg,
                dir: RdmaDir::Read,
                offset: plan.offset,
                length: plan.length,
                remote_stag: plan.remote.0,
                remote_va: plan.remote.1,
            },
        )?;

        let mut chain = reg.wrs.clone();
        if let Some(last) = chain.last_mut() {
            last.wr_id = WrId::Cmd(tag).encode();
            last.signaled = true;
        }
        log::debug!(
            "Conn {}: {:?} RDMA Read {} bytes at offset {} from stag {:#x}",
            self.id(),
            tag,
            plan.length,
            plan.offset,
            plan.remote.0
        );

        {
            let mut cmds = lock(&self.inner.cmds);
            let Some(cmd) = cmds.get_mut(tag) else {
                drop(cmds);
                registration::abandon(pool, reg, tag);
                return Err(unknown_command(tag));
            };
            cmd.op = CmdOp::RdmaRead;
            cmd.reg = Some(reg);
        }

        let posted = self.reserve_sends(1).and_then(|()| {
            self.verbs().post_send(self.inner.qp.qp, &chain).map_err(|e| {
                self.release_sends(1);
                log::error!("Conn {}: RDMA Read post for {:?} failed: {}", self.id(), tag, e);
                IsertError::PostFailed(e.to_string())
            })
        });
        if posted.is_err() {
            let reg = lock(&self.inner.cmds).get_mut(tag).and_then(|cmd| {
                cmd.op = CmdOp::Idle;
                cmd.reg.take()
            });
            if let Some(reg) = reg {
                registration::abandon(pool, reg, tag);
            }
        }
        posted
    }

    /// The signaled RDMA Read of a command completed
    pub(crate) fn on_rdma_read_complete(&self, tag: CmdTag, status: WcStatus) {
        let reg = lock(&self.inner.cmds).get_mut(tag).and_then(|cmd| {
            cmd.op = CmdOp::Idle;
            cmd.reg.take()
        });
        let Some(reg) = reg else {
            log::warn!("Conn {}: RDMA Read completion without registration for {:?}", self.id(), tag);
            return;
        };
        let length = reg.length;
        registration::unregister(self.inner.fr_pool.as_ref(), reg, tag);

        if !status.is_success() {
            log::debug!("Conn {}: RDMA Read for {:?} ended with {:?}", self.id(), tag, status);
            self.release_cmd(tag);
            return;
        }
        if let Some(cmd) = lock(&self.inner.cmds).get_mut(tag) {
            cmd.write_data_done += length;
        }
        log::debug!("Conn {}: {:?} fetched {} bytes of Data-Out", self.id(), tag, length);
        self.shared().handler.execute(self, tag);
    }
}
