//! iSER target transport
//!
//! This library implements the target side of iSCSI Extensions for RDMA
//! (RFC 7145): it accepts RDMA connections, moves iSCSI PDUs over send and
//! receive work requests, and transfers SCSI data with RDMA Read and Write
//! directly between initiator memory and target buffers. iSCSI semantics
//! (login negotiation, PDU construction, command execution) stay with the
//! layer above, which plugs in through the [`PduHandler`] trait.
//!
//! RDMA hardware is reached through the [`Verbs`] trait; [`soft::SoftRdma`]
//! is an in-memory implementation that drives the transport without an
//! adapter.
//!
//! # Example
//!
//! ```no_run
//! use iser_target::soft::SoftRdma;
//! use iser_target::{
//!     BuiltPdu, CmdTag, Connection, IsertResult, IsertTransport, LoginResponse, PduHandler,
//!     ResponseState, RxPdu, TransportConfig,
//! };
//! use std::sync::Arc;
//!
//! struct NullTarget;
//!
//! impl PduHandler for NullTarget {
//!     fn handle_pdu(&self, _conn: &Connection, _pdu: RxPdu<'_>) -> IsertResult<()> {
//!         Ok(())
//!     }
//!
//!     fn build_pdu(&self, _conn: &Connection, _cmd: CmdTag, _state: ResponseState) -> IsertResult<BuiltPdu> {
//!         Ok(BuiltPdu { bhs: [0u8; 48], data: Vec::new() })
//!     }
//!
//!     fn execute(&self, _conn: &Connection, _cmd: CmdTag) {}
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let verbs = Arc::new(SoftRdma::new());
//! verbs.add_adapter(1, SoftRdma::fast_reg_attr());
//!
//! let transport = IsertTransport::builder()
//!     .config(TransportConfig::default())
//!     .build(verbs, Arc::new(NullTarget))?;
//! let listener = transport.setup_listener("0.0.0.0:3260".parse()?)?;
//! let conn = transport.accept(&listener)?;
//!
//! let login = transport.get_login_rx(&conn)?;
//! transport.put_login_tx(
//!     &conn,
//!     &LoginResponse { bhs: login.bhs, data: Vec::new(), complete: true, failed: false },
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod handler;
pub mod proto;
mod rdma;
pub mod registration;
mod rx;
pub mod soft;
pub mod transport;
mod tx;
pub mod verbs;
mod worker;

pub use config::{CompletionMode, TransportConfig};
pub use connection::{CmdTag, CommandInfo, ConnState, Connection, ConnectionId, DataBuffer};
pub use device::{Device, DeviceRegistry};
pub use error::{IsertError, IsertResult};
pub use handler::{BuiltPdu, LoginPdu, LoginResponse, PduHandler, ResponseState, RxPdu};
pub use proto::{Bhs, IserHeader};
pub use registration::{FastRegPool, RegStrategy};
pub use transport::{IsertTransport, IsertTransportBuilder, Listener};
pub use verbs::{HostBuffer, Verbs};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
