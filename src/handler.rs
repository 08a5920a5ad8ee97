//! Interface to the iSCSI layer above the transport
//!
//! The transport moves PDUs and data; everything that needs iSCSI or SCSI
//! knowledge (login negotiation, building response PDUs, executing commands)
//! is delegated to an implementation of [`PduHandler`].

use crate::connection::{CmdTag, ConnState, Connection, ConnectionId};
use crate::error::IsertResult;
use crate::proto::{Bhs, IserHeader, BHS_SIZE};

/// Which PDU the upper layer should build for a queued response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// SCSI response, optional sense data as payload
    Status,
    /// NOP-In (immediate queue: NOP-In expecting a NOP-Out reply)
    NopIn,
    TaskMgmtResponse,
    /// Payload is the rejected PDU's BHS
    Reject,
    TextResponse,
    LogoutResponse,
}

impl ResponseState {
    /// Control responses are completed through the deferred worker
    pub fn is_control(self) -> bool {
        matches!(
            self,
            ResponseState::TaskMgmtResponse
                | ResponseState::Reject
                | ResponseState::TextResponse
                | ResponseState::LogoutResponse
        )
    }

    /// Status responses may share a signaled completion
    pub fn coalesces(self) -> bool {
        self == ResponseState::Status
    }
}

/// A PDU built by the upper layer
#[derive(Debug, Clone)]
pub struct BuiltPdu {
    pub bhs: [u8; BHS_SIZE],
    /// Data segment; raw sense bytes for `Status`
    pub data: Vec<u8>,
}

/// Login request received on the dedicated login buffer
#[derive(Debug, Clone)]
pub struct LoginPdu {
    pub header: IserHeader,
    pub bhs: [u8; BHS_SIZE],
    pub data: Vec<u8>,
}

/// Login response handed to `put_login_tx`
#[derive(Debug, Clone)]
pub struct LoginResponse {
    pub bhs: [u8; BHS_SIZE],
    pub data: Vec<u8>,
    /// Final login response; the connection enters full feature phase
    pub complete: bool,
    /// Login rejected; no further login receive is posted
    pub failed: bool,
}

/// Steady-state PDU received from the initiator
#[derive(Debug)]
pub struct RxPdu<'a> {
    pub header: IserHeader,
    pub bhs: Bhs,
    pub raw_bhs: &'a [u8],
    pub data: &'a [u8],
    /// Command context allocated by the transport, absent for Data-Out
    pub cmd: Option<CmdTag>,
}

/// Upper layer callbacks
///
/// Callbacks run on completion workers or the deferred worker and must not
/// block for long. None of them is called with a transport lock held.
pub trait PduHandler: Send + Sync {
    /// Steady-state PDU; an error releases the command context
    fn handle_pdu(&self, conn: &Connection, pdu: RxPdu<'_>) -> IsertResult<()>;

    /// Build the PDU for a queued response
    fn build_pdu(&self, conn: &Connection, cmd: CmdTag, state: ResponseState)
        -> IsertResult<BuiltPdu>;

    /// All Data-Out for the command has been fetched
    fn execute(&self, conn: &Connection, cmd: CmdTag);

    /// A control response left the wire
    fn control_complete(&self, _conn: &Connection, _cmd: CmdTag, _state: ResponseState) {}

    /// The transport dropped its command context
    fn release_command(&self, _conn: &Connection, _cmd: CmdTag) {}

    /// The connection failed underneath the session (reinstatement)
    fn connection_lost(&self, _conn: &Connection) {}

    fn state_changed(&self, _conn: ConnectionId, _from: ConnState, _to: ConnState) {}
}

// ============================================================================
// Unit Tests
// ============================================================================
