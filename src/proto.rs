//! iSER transport header and iSCSI basic header view
//!
//! Every PDU on an iSER connection is prefixed with a fixed 28 byte transport
//! header (RFC 7145 Section 9.2) followed by the 48 byte iSCSI BHS
//! (RFC 3720 Section 10.2). Only the fields the transport needs are decoded
//! here; building iSCSI PDUs is the upper layer's job.

use crate::error::{IsertError, IsertResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// iSER transport header size in bytes
pub const ISER_HDR_LEN: usize = 28;

/// Transport header plus BHS
pub const ISER_HEADERS_LEN: usize = ISER_HDR_LEN + BHS_SIZE;

/// iSCSI PDU Opcodes handled by the transport (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (client → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;

    // Target opcodes (target → client)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const REJECT: u8 = 0x3F;
}

/// Transport header flag byte (RFC 7145 Section 9.2)
pub mod iser_flags {
    /// Message type occupies the high nibble
    pub const TYPE_MASK: u8 = 0xF0;
    pub const ISCSI_CTRL: u8 = 0x10;
    pub const HELLO: u8 = 0x20;
    pub const HELLO_REPLY: u8 = 0x30;

    /// Write STag and VA are valid
    pub const WSV: u8 = 0x08;
    /// Read STag and VA are valid
    pub const RSV: u8 = 0x04;
}

/// Message type carried in the transport header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IserMsgKind {
    IscsiCtrl,
    Hello,
    HelloReply,
    Unknown(u8),
}

/// iSER transport header - 28 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///    +---------------+---------------+---------------+---------------+
///   0| Type  |W|R|   | Reserved                                      |
///    +---------------+---------------+---------------+---------------+
///   4| Write STag                                                    |
///    +---------------+---------------+---------------+---------------+
///   8| Write Base Offset (VA)                                        |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Read STag                                                     |
///    +---------------+---------------+---------------+---------------+
///  20| Read Base Offset (VA)                                         |
///    +                                                               +
///  24|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IserHeader {
    pub flags: u8,
    /// Initiator buffer holding SCSI write data, fetched with RDMA Read
    pub write_stag: u32,
    pub write_va: u64,
    /// Initiator buffer receiving SCSI read data, filled with RDMA Write
    pub read_stag: u32,
    pub read_va: u64,
}

impl IserHeader {
    /// Header for a plain iSCSI control PDU sent by the target
    pub fn ctrl() -> Self {
        IserHeader { flags: iser_flags::ISCSI_CTRL, ..Default::default() }
    }

    /// Parse a transport header
    ///
    /// Tag/address pairs whose valid bit is clear are reported as zero.
    pub fn from_bytes(buf: &[u8]) -> IsertResult<Self> {
        if buf.len() < ISER_HDR_LEN {
            return Err(IsertError::InvalidHeader(format!(
                "transport header too short: {} bytes, need {}",
                buf.len(),
                ISER_HDR_LEN
            )));
        }

        let mut cursor = Cursor::new(buf);
        let flags = cursor.read_u8()?;
        // Bytes 1-3: reserved
        let _reserved_hi = cursor.read_u8()?;
        let _reserved_lo = cursor.read_u16::<BigEndian>()?;
        let write_stag = cursor.read_u32::<BigEndian>()?;
        let write_va = cursor.read_u64::<BigEndian>()?;
        let read_stag = cursor.read_u32::<BigEndian>()?;
        let read_va = cursor.read_u64::<BigEndian>()?;

        let mut hdr = IserHeader { flags, ..Default::default() };
        if flags & iser_flags::WSV != 0 {
            hdr.write_stag = write_stag;
            hdr.write_va = write_va;
        }
        if flags & iser_flags::RSV != 0 {
            hdr.read_stag = read_stag;
            hdr.read_va = read_va;
        }
        Ok(hdr)
    }

    /// Serialize into the first 28 bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) -> IsertResult<()> {
        if buf.len() < ISER_HDR_LEN {
            return Err(IsertError::InvalidHeader(format!(
                "buffer too short for transport header: {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(&mut buf[..ISER_HDR_LEN]);
        cursor.write_u8(self.flags)?;
        cursor.write_u8(0)?;
        cursor.write_u16::<BigEndian>(0)?;
        cursor.write_u32::<BigEndian>(self.write_stag)?;
        cursor.write_u64::<BigEndian>(self.write_va)?;
        cursor.write_u32::<BigEndian>(self.read_stag)?;
        cursor.write_u64::<BigEndian>(self.read_va)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; ISER_HDR_LEN] {
        let mut buf = [0u8; ISER_HDR_LEN];
        // Length is fixed, cannot fail
        let _ = self.write_to(&mut buf);
        buf
    }

    pub fn kind(&self) -> IserMsgKind {
        match self.flags & iser_flags::TYPE_MASK {
            iser_flags::ISCSI_CTRL => IserMsgKind::IscsiCtrl,
            iser_flags::HELLO => IserMsgKind::Hello,
            iser_flags::HELLO_REPLY => IserMsgKind::HelloReply,
            other => IserMsgKind::Unknown(other),
        }
    }

    /// Remote buffer for Data-In (target RDMA Write)
    pub fn read_target(&self) -> Option<(u32, u64)> {
        (self.flags & iser_flags::RSV != 0).then_some((self.read_stag, self.read_va))
    }

    /// Remote buffer for Data-Out (target RDMA Read)
    pub fn write_target(&self) -> Option<(u32, u64)> {
        (self.flags & iser_flags::WSV != 0).then_some((self.write_stag, self.write_va))
    }
}

/// The few BHS fields the transport inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bhs {
    /// Lower 6 bits of byte 0
    pub opcode: u8,
    pub immediate: bool,
    pub flags: u8,
    /// Data segment length (bytes 5-7)
    pub data_length: u32,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
}

impl Bhs {
    pub fn from_bytes(buf: &[u8]) -> IsertResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IsertError::InvalidHeader(format!(
                "BHS too short: {} bytes, need {}",
                buf.len(),
                BHS_SIZE
            )));
        }
        let mut cursor = Cursor::new(buf);
        let byte0 = cursor.read_u8()?;
        let flags = cursor.read_u8()?;
        let _reserved = cursor.read_u16::<BigEndian>()?;
        let _ahs_length = cursor.read_u8()?;
        let ds_len_high = cursor.read_u8()? as u32;
        let ds_len_low = cursor.read_u16::<BigEndian>()? as u32;
        let _lun = cursor.read_u64::<BigEndian>()?;
        let itt = cursor.read_u32::<BigEndian>()?;

        Ok(Bhs {
            opcode: byte0 & 0x3F,
            immediate: byte0 & 0x40 != 0,
            flags,
            data_length: (ds_len_high << 16) | ds_len_low,
            itt,
        })
    }
}

/// Round up to the 4 byte PDU padding boundary
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Frame sense data as a SCSI response data segment
///
/// A 2 byte SenseLength prefix followed by the sense bytes, padded to 4 bytes
/// (RFC 3720 Section 10.4.7).
pub fn frame_sense_data(sense: &[u8]) -> IsertResult<Vec<u8>> {
    let sense_len = u16::try_from(sense.len())
        .map_err(|_| IsertError::Protocol(format!("sense data too long: {}", sense.len())))?;
    let mut out = Vec::with_capacity(padded_len(sense.len() + 2));
    out.write_u16::<BigEndian>(sense_len)?;
    out.extend_from_slice(sense);
    out.resize(padded_len(out.len()), 0);
    Ok(out)
}

// ============================================================================
// Unit Tests
// ============================================================================
