//! The fixed 48-byte USB/IP PDU header.
//!
//! Layout mirrors the upstream USB/IP wire format: a 20-byte common prefix
//! (command, seqnum, devid, direction, ep) followed by a 28-byte
//! command-specific union, all in network byte order. The union's concrete
//! shape lives in [`crate::submit`]; this module only handles the common
//! prefix, the command tag, and byteswap.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::vhci_error::{Result, VhciError};

/// Total size of a PDU header on the wire: 20-byte common prefix + 28-byte
/// command union.
pub const HEADER_SIZE: usize = 48;

/// Transfer direction as carried in the header's `direction` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

impl Direction {
    pub fn from_wire(v: u32) -> Result<Direction> {
        match v {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            other => Err(VhciError::protocol(format!("bad direction {other}"))),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }

    pub fn is_out(self) -> bool {
        matches!(self, Direction::Out)
    }
}

/// The four USB/IP commands this client speaks. The full upstream protocol
/// defines more (device list requests); this core's explicit non-goals
/// exclude device discovery, so only these four are recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CmdSubmit = 0x0001,
    CmdUnlink = 0x0002,
    RetSubmit = 0x0003,
    RetUnlink = 0x0004,
}

impl Command {
    pub fn from_wire(v: u32) -> Result<Command> {
        match v {
            0x0001 => Ok(Command::CmdSubmit),
            0x0002 => Ok(Command::CmdUnlink),
            0x0003 => Ok(Command::RetSubmit),
            0x0004 => Ok(Command::RetUnlink),
            other => Err(VhciError::protocol(format!("unknown command {other:#x}"))),
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// The common 20-byte prefix shared by all four PDU kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub command: Command,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
}

impl CommonHeader {
    pub const SIZE: usize = 20;

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.command.to_wire())?;
        w.write_u32::<BigEndian>(self.seqnum)?;
        w.write_u32::<BigEndian>(self.devid)?;
        w.write_u32::<BigEndian>(self.direction.to_wire())?;
        w.write_u32::<BigEndian>(self.ep)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<CommonHeader> {
        let command = Command::from_wire(r.read_u32::<BigEndian>()?)?;
        let seqnum = r.read_u32::<BigEndian>()?;
        let devid = r.read_u32::<BigEndian>()?;
        let direction = Direction::from_wire(r.read_u32::<BigEndian>()?)?;
        let ep = r.read_u32::<BigEndian>()?;

        if !crate::seqnum::is_valid(seqnum) {
            return Err(VhciError::protocol(format!("invalid seqnum {seqnum:#x}")));
        }
        if ep > 15 {
            return Err(VhciError::protocol(format!("ep out of range: {ep}")));
        }

        Ok(CommonHeader {
            command,
            seqnum,
            devid,
            direction,
            ep,
        })
    }
}

/// Reads exactly [`HEADER_SIZE`] bytes and returns the parsed common prefix
/// plus the raw command-specific bytes (28 bytes), for the caller to hand
/// to the matching decoder in [`crate::submit`].
pub fn decode_header(bytes: &[u8]) -> Result<(CommonHeader, [u8; 28])> {
    if bytes.len() < HEADER_SIZE {
        return Err(VhciError::buffer_too_small(HEADER_SIZE, bytes.len()));
    }
    let mut cur = Cursor::new(bytes);
    let common = CommonHeader::read_from(&mut cur)?;
    let mut tail = [0u8; 28];
    cur.read_exact(&mut tail)?;
    Ok((common, tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_header_roundtrips() {
        let h = CommonHeader {
            command: Command::CmdSubmit,
            seqnum: 3,
            devid: 0x0001_0002,
            direction: Direction::Out,
            ep: 2,
        };
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), CommonHeader::SIZE);
        let decoded = CommonHeader::read_from(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn rejects_invalid_seqnum() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(Command::CmdSubmit.to_wire()).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap(); // numeric payload 0 -> invalid
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        assert!(CommonHeader::read_from(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Command::from_wire(0x9999).is_err());
    }

    #[test]
    fn rejects_ep_out_of_range() {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(Command::CmdSubmit.to_wire()).unwrap();
        buf.write_u32::<BigEndian>(2).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(0).unwrap();
        buf.write_u32::<BigEndian>(16).unwrap();
        assert!(CommonHeader::read_from(&mut Cursor::new(&buf)).is_err());
    }
}
