//! Isochronous packet descriptors and the OUT-compaction / IN-restoration
//! repack algorithms described in §3 and §4.5.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::vhci_error::{Result, VhciError};

/// On-wire size of one iso packet descriptor: offset, length, actual_length,
/// status, each a 4-byte big-endian integer.
pub const ISO_PACKET_SIZE: usize = 16;

/// A protocol-level cap on the number of iso packets in a single PDU.
pub const USBIP_MAX_ISO_PACKETS: usize = 1024;

/// One wire-format iso packet descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub fn write(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        w.write_u32::<BigEndian>(self.offset)?;
        w.write_u32::<BigEndian>(self.length)?;
        w.write_u32::<BigEndian>(self.actual_length)?;
        w.write_i32::<BigEndian>(self.status)
    }

    pub fn read(r: &mut impl std::io::Read) -> std::io::Result<Self> {
        Ok(IsoPacketDescriptor {
            offset: r.read_u32::<BigEndian>()?,
            length: r.read_u32::<BigEndian>()?,
            actual_length: r.read_u32::<BigEndian>()?,
            status: r.read_i32::<BigEndian>()?,
        })
    }
}

/// One client-side packet description: where in the local transfer buffer
/// this packet's data lives, and how long it is. This is the "URB iso
/// descriptor" of §4.1/§4.5, decoupled from the OS URB type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIsoPacket {
    pub offset: u32,
    pub length: u32,
}

/// Encodes the wire iso packet array for a CMD_SUBMIT, compacting
/// sender-side gaps: `{offset, length = next_offset - offset, actual_length
/// = 0, status = 0}` for each packet in order.
///
/// The sum of `length` must equal `transfer_buffer_length` exactly; any gap
/// or reverse offset is `INVALID_PARAMETER`. Packet count must not exceed
/// [`USBIP_MAX_ISO_PACKETS`].
pub fn repack_iso_out(
    packets: &[LocalIsoPacket],
    transfer_buffer_length: u32,
) -> Result<Vec<IsoPacketDescriptor>> {
    if packets.len() > USBIP_MAX_ISO_PACKETS {
        return Err(VhciError::invalid_parameter(format!(
            "{} packets exceeds max {}",
            packets.len(),
            USBIP_MAX_ISO_PACKETS
        )));
    }

    let mut out = Vec::with_capacity(packets.len());
    for (i, p) in packets.iter().enumerate() {
        let next_offset = packets
            .get(i + 1)
            .map(|n| n.offset)
            .unwrap_or(transfer_buffer_length);

        if next_offset < p.offset {
            return Err(VhciError::invalid_parameter(format!(
                "packet {i}: reverse offset {} -> {}",
                p.offset, next_offset
            )));
        }
        let length = next_offset - p.offset;

        out.push(IsoPacketDescriptor {
            offset: p.offset,
            length,
            actual_length: 0,
            status: 0,
        });
    }

    let total: u32 = out.iter().map(|d| d.length).sum();
    if total != transfer_buffer_length {
        return Err(VhciError::invalid_parameter(format!(
            "packet lengths sum to {total}, expected {transfer_buffer_length}"
        )));
    }

    Ok(out)
}

/// Parses `count` iso packet descriptors from `bytes` (exactly
/// `count * ISO_PACKET_SIZE` bytes).
pub fn decode_iso_packets(bytes: &[u8], count: usize) -> Result<Vec<IsoPacketDescriptor>> {
    if bytes.len() < count * ISO_PACKET_SIZE {
        return Err(VhciError::buffer_too_small(count * ISO_PACKET_SIZE, bytes.len()));
    }
    let mut cur = Cursor::new(bytes);
    (0..count)
        .map(|_| IsoPacketDescriptor::read(&mut cur).map_err(VhciError::from))
        .collect()
}

/// Restores per-packet padding for an isochronous IN completion.
///
/// The server has compacted per-packet payloads back-to-back in wire order;
/// `local` describes each packet's original offset/length in the client's
/// transfer buffer, and `wire` carries the server's reported
/// `actual_length`/`status` per packet. Packets are walked in *reverse*
/// so that copying a later packet's data to its (larger) original offset
/// never overwrites data belonging to an earlier packet still waiting to
/// be moved.
///
/// Returns the list of `(local_offset, data)` moves the caller must apply
/// to the transfer buffer. Whether the overall transfer is the
/// [`IsochQuirk::AllFailed`] case is decided by the caller from the
/// RET_SUBMIT header's `error_count` field, not from this function —
/// per-packet `status` here is only a cross-check, not the source of truth.
pub fn repack_iso_in(
    local: &[LocalIsoPacket],
    wire: &[IsoPacketDescriptor],
    compacted_payload: &[u8],
) -> Result<Vec<(u32, Vec<u8>)>> {
    if local.len() != wire.len() {
        return Err(VhciError::invalid_parameter(format!(
            "local packet count {} != wire packet count {}",
            local.len(),
            wire.len()
        )));
    }

    let mut moves = Vec::with_capacity(local.len());
    let mut running_source_offset = compacted_payload.len() as u64;

    for i in (0..local.len()).rev() {
        let l = &local[i];
        let w = &wire[i];

        if w.offset != l.offset {
            return Err(VhciError::invalid_parameter(format!(
                "packet {i}: wire offset {} != local offset {}",
                w.offset, l.offset
            )));
        }
        if w.actual_length > w.length {
            return Err(VhciError::invalid_parameter(format!(
                "packet {i}: actual_length {} > length {}",
                w.actual_length, w.length
            )));
        }

        let actual = w.actual_length as u64;
        if actual > running_source_offset {
            return Err(VhciError::invalid_parameter(format!(
                "packet {i}: source offset underflow",
            )));
        }
        running_source_offset -= actual;

        let start = running_source_offset as usize;
        let end = start + w.actual_length as usize;
        let data = compacted_payload
            .get(start..end)
            .ok_or_else(|| VhciError::invalid_parameter(format!("packet {i}: out of bounds slice")))?
            .to_vec();

        moves.push((l.offset, data));
    }

    if running_source_offset != 0 {
        return Err(VhciError::invalid_parameter(
            "running source offset did not reach zero: payload size mismatch",
        ));
    }

    moves.reverse();

    Ok(moves)
}

/// Whether the isoch bulk-quirk (§4.5/§9 open question) should force the
/// overall transfer status, even if individual packets reported success.
/// Decided from the RET_SUBMIT header's `error_count` vs. `number_of_packets`
/// (see [`quirk_from_error_count`]), never from a per-packet recount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsochQuirk {
    None,
    AllFailed,
}

/// Decides the isoch quirk from the RET_SUBMIT header fields directly:
/// `AllFailed` iff `error_count == number_of_packets` and that count is
/// non-zero. `error_count` is the header's own tally and may legitimately
/// disagree with a per-packet recount of `status != 0`; the header is
/// authoritative.
pub fn quirk_from_error_count(error_count: u32, number_of_packets: u32) -> IsochQuirk {
    if number_of_packets != 0 && error_count == number_of_packets {
        IsochQuirk::AllFailed
    } else {
        IsochQuirk::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repack_out_compacts_contiguous_packets() {
        let packets = [
            LocalIsoPacket { offset: 0, length: 0 },
            LocalIsoPacket { offset: 188, length: 0 },
            LocalIsoPacket { offset: 376, length: 0 },
        ];
        let wire = repack_iso_out(&packets, 564).unwrap();
        assert_eq!(wire[0].length, 188);
        assert_eq!(wire[1].length, 188);
        assert_eq!(wire[2].length, 188);
    }

    #[test]
    fn repack_out_rejects_reverse_offsets() {
        let packets = [
            LocalIsoPacket { offset: 100, length: 0 },
            LocalIsoPacket { offset: 50, length: 0 },
        ];
        assert!(repack_iso_out(&packets, 100).is_err());
    }

    #[test]
    fn repack_out_rejects_length_mismatch() {
        let packets = [LocalIsoPacket { offset: 0, length: 0 }];
        assert!(repack_iso_out(&packets, 100).is_err());
    }

    #[test]
    fn repack_in_restores_padding_reverse_order() {
        // URB offsets [0, 188, 376], lengths implied by next offset / total 564.
        let local = [
            LocalIsoPacket { offset: 0, length: 188 },
            LocalIsoPacket { offset: 188, length: 188 },
            LocalIsoPacket { offset: 376, length: 188 },
        ];
        let wire = [
            IsoPacketDescriptor { offset: 0, length: 188, actual_length: 188, status: 0 },
            IsoPacketDescriptor { offset: 188, length: 188, actual_length: 180, status: 0 },
            IsoPacketDescriptor { offset: 376, length: 188, actual_length: 132, status: 0 },
        ];
        // compacted payload: 188 + 180 + 132 = 500 bytes, fill with a marker pattern.
        let mut payload = Vec::new();
        payload.extend(std::iter::repeat(1u8).take(188));
        payload.extend(std::iter::repeat(2u8).take(180));
        payload.extend(std::iter::repeat(3u8).take(132));

        let moves = repack_iso_in(&local, &wire, &payload).unwrap();
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[0], (0, vec![1u8; 188]));
        assert_eq!(moves[1], (188, vec![2u8; 180]));
        assert_eq!(moves[2], (376, vec![3u8; 132]));
    }

    #[test]
    fn quirk_from_error_count_detects_all_failed() {
        assert_eq!(quirk_from_error_count(1, 1), IsochQuirk::AllFailed);
        assert_eq!(quirk_from_error_count(0, 0), IsochQuirk::None);
        assert_eq!(quirk_from_error_count(1, 2), IsochQuirk::None);
    }

    #[test]
    fn repack_in_rejects_offset_mismatch() {
        let local = [LocalIsoPacket { offset: 0, length: 10 }];
        let wire = [IsoPacketDescriptor { offset: 5, length: 10, actual_length: 0, status: 0 }];
        assert!(repack_iso_in(&local, &wire, &[]).is_err());
    }

    #[test]
    fn repack_in_rejects_actual_exceeding_length() {
        let local = [LocalIsoPacket { offset: 0, length: 10 }];
        let wire = [IsoPacketDescriptor { offset: 0, length: 10, actual_length: 20, status: 0 }];
        assert!(repack_iso_in(&local, &wire, &[0u8; 20]).is_err());
    }

    #[test]
    fn iso_descriptor_roundtrips() {
        let d = IsoPacketDescriptor { offset: 1, length: 2, actual_length: 3, status: -4 };
        let mut buf = Vec::new();
        d.write(&mut buf).unwrap();
        assert_eq!(buf.len(), ISO_PACKET_SIZE);
        let decoded = IsoPacketDescriptor::read(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, d);
    }
}
