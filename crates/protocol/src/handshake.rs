//! The OP_REQ_IMPORT / OP_REP_IMPORT handshake that precedes the PDU stream
//! on a freshly connected per-device socket (§6 "Wire protocol").
//!
//! The codes and common reply layout are grounded in the upstream USB/IP
//! `op_common` exchange (version check before command-code check before
//! status check, exactly the order `recv_op_common` enforces in the
//! original driver): a version mismatch is [`Kind::Version`], an
//! unexpected reply code is [`Kind::Protocol`], and a non-zero status is
//! mapped through the errno table.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::kind::Kind;
use crate::vhci_error::{Result, VhciError};

/// USB/IP wire protocol version this client speaks.
pub const USBIP_VERSION: u16 = 0x0111;

const OP_REQ_IMPORT: u16 = 0x8003;
const OP_REP_IMPORT: u16 = 0x0003;

const BUSID_SIZE: usize = 32;
const PATH_SIZE: usize = 256;


/// Common reply prefix shared by every `OP_REP_*` message.
struct OpCommon {
    version: u16,
    code: u16,
    status: u32,
}

impl OpCommon {
    const SIZE: usize = 8;

    fn read(r: &mut impl Read) -> Result<Self> {
        Ok(OpCommon {
            version: r.read_u16::<BigEndian>()?,
            code: r.read_u16::<BigEndian>()?,
            status: r.read_u32::<BigEndian>()?,
        })
    }
}

/// Validates the common reply prefix against an expected code, per
/// `recv_op_common`: version first, then code, then status.
fn check_op_common(common: &OpCommon, expected_code: u16) -> Result<()> {
    if common.version != USBIP_VERSION {
        return Err(VhciError::new(
            Kind::Version,
            format!("server version {:#06x} != ours {:#06x}", common.version, USBIP_VERSION),
        ));
    }
    if common.code != expected_code {
        return Err(VhciError::new(
            Kind::Protocol,
            format!("unexpected reply code {:#06x}, expected {:#06x}", common.code, expected_code),
        ));
    }
    if common.status != 0 {
        return Err(VhciError::new(
            crate::kind::kind_from_errno(common.status as i32),
            format!("server reported status {}", common.status),
        ));
    }
    Ok(())
}

/// A fixed-width, NUL-padded ASCII string field as carried on the wire
/// (`busid`, `path`). Truncates/pads to `N` bytes; embedded NULs terminate
/// the logical string on decode.
fn write_fixed<const N: usize>(w: &mut impl Write, s: &str) -> std::io::Result<()> {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&buf)
}

fn read_fixed<const N: usize>(r: &mut impl Read) -> std::io::Result<String> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(N);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Encodes an `OP_REQ_IMPORT` request identifying the device by `busid`.
pub fn encode_req_import(busid: &str) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(OpCommon::SIZE + BUSID_SIZE);
    buf.write_u16::<BigEndian>(USBIP_VERSION)?;
    buf.write_u16::<BigEndian>(OP_REQ_IMPORT)?;
    buf.write_u32::<BigEndian>(0)?;
    write_fixed::<BUSID_SIZE>(&mut buf, busid)?;
    Ok(buf)
}

/// The USB/IP device record carried in `OP_REP_IMPORT`, supplemented per
/// the original driver's `usbip_usb_device` layout (SPEC_FULL §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub busid: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

/// Total byte length of an `OP_REP_IMPORT` reply (common prefix + device
/// record), so a caller reading from a socket knows exactly how much to
/// buffer before calling [`decode_rep_import`].
pub const REP_IMPORT_REPLY_SIZE: usize = OpCommon::SIZE + DeviceRecord::WIRE_SIZE;

impl DeviceRecord {
    pub const WIRE_SIZE: usize = PATH_SIZE + BUSID_SIZE + 4 + 4 + 4 + 2 + 2 + 2 + 1 + 1 + 1 + 1 + 1 + 1;

    fn read(r: &mut impl Read) -> std::io::Result<Self> {
        Ok(DeviceRecord {
            path: read_fixed::<PATH_SIZE>(r)?,
            busid: read_fixed::<BUSID_SIZE>(r)?,
            busnum: r.read_u32::<BigEndian>()?,
            devnum: r.read_u32::<BigEndian>()?,
            speed: r.read_u32::<BigEndian>()?,
            id_vendor: r.read_u16::<BigEndian>()?,
            id_product: r.read_u16::<BigEndian>()?,
            bcd_device: r.read_u16::<BigEndian>()?,
            device_class: r.read_u8()?,
            device_subclass: r.read_u8()?,
            device_protocol: r.read_u8()?,
            configuration_value: r.read_u8()?,
            num_configurations: r.read_u8()?,
            num_interfaces: r.read_u8()?,
        })
    }
}

/// Parses an `OP_REP_IMPORT` reply, checking it against `requested_busid`
/// per the boundary case in §8: a busid mismatch is `PROTOCOL`.
pub fn decode_rep_import(bytes: &[u8], requested_busid: &str) -> Result<DeviceRecord> {
    let mut cur = Cursor::new(bytes);
    let common = OpCommon::read(&mut cur)?;
    check_op_common(&common, OP_REP_IMPORT)?;

    if bytes.len() < OpCommon::SIZE + DeviceRecord::WIRE_SIZE {
        return Err(VhciError::buffer_too_small(
            OpCommon::SIZE + DeviceRecord::WIRE_SIZE,
            bytes.len(),
        ));
    }

    let record = DeviceRecord::read(&mut cur)?;
    if record.busid != requested_busid {
        return Err(VhciError::new(
            Kind::Protocol,
            format!("OP_REP_IMPORT busid {} != requested {}", record.busid, requested_busid),
        ));
    }
    Ok(record)
}
