//! Command-specific 28-byte tails, and the header-builders described in
//! spec §4.1: `encode_submit`, `encode_unlink`, `byteswap`, `get_payload_size`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};

use crate::devid::Devid;
use crate::header::{Command, CommonHeader, Direction};
use crate::iso::ISO_PACKET_SIZE;
use crate::vhci_error::{Result, VhciError};

/// Sentinel for `number_of_packets` meaning "not an isochronous transfer".
pub const NON_ISOCH: u32 = 0xFFFF_FFFF;

/// Decoded PDU, common header plus its command-specific tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pdu {
    CmdSubmit(CommonHeader, CmdSubmitBody),
    RetSubmit(CommonHeader, RetSubmitBody),
    CmdUnlink(CommonHeader, CmdUnlinkBody),
    RetUnlink(CommonHeader, RetUnlinkBody),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmitBody {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl CmdSubmitBody {
    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.transfer_flags)?;
        w.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        w.write_i32::<BigEndian>(self.start_frame as i32)?;
        w.write_u32::<BigEndian>(self.number_of_packets)?;
        w.write_u32::<BigEndian>(self.interval)?;
        w.write_all(&self.setup)
    }

    fn read(tail: &[u8; 28]) -> io::Result<Self> {
        let mut c = Cursor::new(&tail[..]);
        let transfer_flags = c.read_u32::<BigEndian>()?;
        let transfer_buffer_length = c.read_u32::<BigEndian>()?;
        let start_frame = c.read_i32::<BigEndian>()? as u32;
        let number_of_packets = c.read_u32::<BigEndian>()?;
        let interval = c.read_u32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        std::io::Read::read_exact(&mut c, &mut setup)?;
        Ok(CmdSubmitBody {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }

    /// `true` when this submission carries isochronous packet descriptors.
    pub fn is_isoch(&self) -> bool {
        self.number_of_packets != NON_ISOCH
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmitBody {
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl RetSubmitBody {
    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_i32::<BigEndian>(self.status)?;
        w.write_u32::<BigEndian>(self.actual_length)?;
        w.write_i32::<BigEndian>(self.start_frame as i32)?;
        w.write_u32::<BigEndian>(self.number_of_packets)?;
        w.write_u32::<BigEndian>(self.error_count)?;
        w.write_all(&[0u8; 8])
    }

    fn read(tail: &[u8; 28]) -> io::Result<Self> {
        let mut c = Cursor::new(&tail[..]);
        let status = c.read_i32::<BigEndian>()?;
        let actual_length = c.read_u32::<BigEndian>()?;
        let start_frame = c.read_i32::<BigEndian>()? as u32;
        let number_of_packets = c.read_u32::<BigEndian>()?;
        let error_count = c.read_u32::<BigEndian>()?;
        Ok(RetSubmitBody {
            status,
            actual_length,
            start_frame,
            number_of_packets,
            error_count,
        })
    }

    pub fn success(actual_length: u32) -> Self {
        RetSubmitBody {
            status: 0,
            actual_length,
            start_frame: 0,
            number_of_packets: NON_ISOCH,
            error_count: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }

    /// Normalizes the wire sentinel to `0` for non-isochronous replies, per
    /// the RX loop pseudocode in §4.5.
    pub fn normalized_number_of_packets(&self) -> u32 {
        if self.number_of_packets == NON_ISOCH {
            0
        } else {
            self.number_of_packets
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlinkBody {
    pub seqnum: u32,
}

impl CmdUnlinkBody {
    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.seqnum)?;
        w.write_all(&[0u8; 24])
    }

    fn read(tail: &[u8; 28]) -> io::Result<Self> {
        let mut c = Cursor::new(&tail[..]);
        Ok(CmdUnlinkBody {
            seqnum: c.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlinkBody {
    pub status: i32,
}

impl RetUnlinkBody {
    fn write(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_i32::<BigEndian>(self.status)?;
        w.write_all(&[0u8; 24])
    }

    fn read(tail: &[u8; 28]) -> io::Result<Self> {
        let mut c = Cursor::new(&tail[..]);
        Ok(RetUnlinkBody {
            status: c.read_i32::<BigEndian>()?,
        })
    }
}

/// Decodes a full PDU from its common header and raw 28-byte tail,
/// dispatching on `common.command`.
pub fn decode_pdu(common: CommonHeader, tail: [u8; 28]) -> Result<Pdu> {
    Ok(match common.command {
        Command::CmdSubmit => Pdu::CmdSubmit(common, CmdSubmitBody::read(&tail)?),
        Command::RetSubmit => Pdu::RetSubmit(common, RetSubmitBody::read(&tail)?),
        Command::CmdUnlink => Pdu::CmdUnlink(common, CmdUnlinkBody::read(&tail)?),
        Command::RetUnlink => Pdu::RetUnlink(common, RetUnlinkBody::read(&tail)?),
    })
}

/// Serializes a full PDU (common header + tail) to network byte order.
pub fn encode_pdu(pdu: &Pdu) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(crate::header::HEADER_SIZE);
    match pdu {
        Pdu::CmdSubmit(c, b) => {
            c.write_to(&mut buf)?;
            b.write(&mut buf)?;
        }
        Pdu::RetSubmit(c, b) => {
            c.write_to(&mut buf)?;
            b.write(&mut buf)?;
        }
        Pdu::CmdUnlink(c, b) => {
            c.write_to(&mut buf)?;
            b.write(&mut buf)?;
        }
        Pdu::RetUnlink(c, b) => {
            c.write_to(&mut buf)?;
            b.write(&mut buf)?;
        }
    }
    Ok(buf)
}

/// Endpoint direction/address, as carried in a descriptor's
/// `bEndpointAddress` byte, used to determine the physical direction of a
/// non-control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn number(&self) -> u32 {
        (self.address & 0x0f) as u32
    }

    /// Physical direction: bit 7 of `bEndpointAddress` set means IN.
    pub fn dir_out(&self) -> bool {
        self.address & 0x80 == 0
    }

    pub fn is_default_control_pipe(&self) -> bool {
        self.address & 0x0f == 0
    }
}

/// Builds a CMD_SUBMIT header+body, per §4.1's direction-normalization and
/// flag-translation rules.
///
/// `setup_dir` is `Some(dir_out)` for the default control pipe (direction
/// comes from the setup packet), `None` for any other endpoint (direction
/// comes from the descriptor). Passing `Some` for a non-control endpoint,
/// or `None` for the control endpoint, is an `INVALID_PARAMETER`.
pub fn encode_submit(
    seqnum_alloc: &crate::seqnum::SeqnumAllocator,
    devid: Devid,
    epd: &EndpointDescriptor,
    transfer_flags: u32,
    transfer_buffer_length: u32,
    setup_dir: Option<bool>,
    setup: [u8; 8],
) -> Result<Pdu> {
    let is_control = epd.is_default_control_pipe();
    if setup_dir.is_some() != is_control {
        return Err(VhciError::invalid_parameter(
            "setup_dir must be Some only for the default control pipe",
        ));
    }

    let dir_out = setup_dir.unwrap_or_else(|| epd.dir_out());
    let transfer_flags = fix_transfer_flags(transfer_flags, dir_out);

    let common = CommonHeader {
        command: Command::CmdSubmit,
        seqnum: seqnum_alloc.next(!dir_out),
        devid: devid.raw(),
        direction: if dir_out { Direction::Out } else { Direction::In },
        ep: epd.number(),
    };

    let body = CmdSubmitBody {
        transfer_flags: crate::flags::to_linux_flags(transfer_flags, !dir_out),
        transfer_buffer_length,
        start_frame: 0,
        number_of_packets: NON_ISOCH,
        interval: epd.interval as u32,
        setup: if is_control { setup } else { [0u8; 8] },
    };

    Ok(Pdu::CmdSubmit(common, body))
}

/// Forces `TransferFlags` direction bits to agree with `dir_out`, mirroring
/// the original driver's `fix_transfer_flags`: OUT clears the short/IN
/// bits, IN sets them.
fn fix_transfer_flags(flags: u32, dir_out: bool) -> u32 {
    const IN_FLAGS: u32 = crate::flags::USBD_SHORT_TRANSFER_OK | crate::flags::USBD_TRANSFER_DIRECTION_IN;
    if dir_out {
        flags & !IN_FLAGS
    } else {
        flags | IN_FLAGS
    }
}

/// Builds a CMD_UNLINK header+body targeting `seqnum_to_cancel`. Direction
/// is always OUT and `ep` is always 0, per §4.4.
pub fn encode_unlink(
    seqnum_alloc: &crate::seqnum::SeqnumAllocator,
    devid: Devid,
    seqnum_to_cancel: u32,
) -> Pdu {
    let common = CommonHeader {
        command: Command::CmdUnlink,
        seqnum: seqnum_alloc.next(false),
        devid: devid.raw(),
        direction: Direction::Out,
        ep: 0,
    };
    Pdu::CmdUnlink(common, CmdUnlinkBody { seqnum: seqnum_to_cancel })
}

/// Computes the exact payload length a receiver must read following this
/// header, per the payload-size rule in §3.
pub fn get_payload_size(pdu: &Pdu) -> usize {
    match pdu {
        Pdu::RetSubmit(common, b) => {
            let iso = b.normalized_number_of_packets() as usize * ISO_PACKET_SIZE;
            let data = if common.direction == Direction::In {
                b.actual_length as usize
            } else {
                0
            };
            data + iso
        }
        Pdu::CmdSubmit(common, b) => {
            let iso = if b.is_isoch() {
                b.number_of_packets as usize * ISO_PACKET_SIZE
            } else {
                0
            };
            let data = if common.direction == Direction::Out {
                b.transfer_buffer_length as usize
            } else {
                0
            };
            data + iso
        }
        Pdu::CmdUnlink(..) | Pdu::RetUnlink(..) => 0,
    }
}
