//! RX engine (C5): the per-device receive loop that reads PDUs off the
//! socket, matches them to their request, restores isochronous padding, and
//! completes the waiting caller.
//!
//! Grounded in the original driver's receive thread pseudocode (§4.5): read
//! header, dispatch on command, read exactly `get_payload_size` bytes,
//! apply the result, loop; any read error or EOF falls through to
//! `detach_and_delete`.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;

use protocol::header::{Command, Direction};
use protocol::iso::{LocalIsoPacket, decode_iso_packets, repack_iso_in};
use protocol::submit::Pdu;
use protocol::{HEADER_SIZE, Kind, decode_pdu, get_payload_size};

use crate::device::{Device, TransferOutcome};
use crate::endpoint::EndpointId;
use crate::request_registry::RequestSearch;

/// What a device attach-time caller needs to translate a completed
/// RET_SUBMIT back into payload bytes at the right offsets: for isoch
/// transfers, each packet's local offset/length (its place in the
/// uncompacted transfer buffer) and the wire-OUT direction. Non-isoch
/// transfers carry `None`.
pub struct IsochLayout {
    pub local_packets: Vec<LocalIsoPacket>,
}

/// Runs the receive loop for one device until the socket closes or a
/// protocol error occurs, then fails every still-pending request and
/// returns the classification that drove the exit.
///
/// `layout_for` resolves the isoch packet layout for a given endpoint, if
/// the in-flight request on that endpoint was isochronous; non-isoch
/// endpoints return `None` and the payload is passed through unchanged.
pub async fn run(
    device: Arc<Device>,
    mut read_half: OwnedReadHalf,
    layout_for: impl Fn(EndpointId) -> Option<IsochLayout>,
) -> Kind {
    loop {
        match read_one(&device, &mut read_half, &layout_for).await {
            Ok(()) => continue,
            Err(kind) => {
                tracing::info!(devid = %device.devid, ?kind, "receive loop exiting");
                device.fail_all_pending(kind);
                return kind;
            }
        }
    }
}

async fn read_one(
    device: &Arc<Device>,
    read_half: &mut OwnedReadHalf,
    layout_for: &impl Fn(EndpointId) -> Option<IsochLayout>,
) -> Result<(), Kind> {
    let mut header_buf = [0u8; HEADER_SIZE];
    read_half.read_exact(&mut header_buf).await.map_err(|_| Kind::Network)?;

    let (common, tail) = protocol::header::decode_header(&header_buf).map_err(|e| e.kind())?;
    let pdu = decode_pdu(common, tail).map_err(|e| e.kind())?;

    let payload_len = get_payload_size(&pdu);
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        read_half.read_exact(&mut payload).await.map_err(|_| Kind::Network)?;
    }

    match pdu {
        Pdu::RetSubmit(header, body) => {
            let endpoint_id = EndpointId::for_number(header.ep, header.direction == Direction::In);
            let handles = device
                .endpoints
                .with_registry(endpoint_id, |reg| reg.remove(RequestSearch::Seqnum(header.seqnum), true))
                .unwrap_or_default();
            let Some(handle) = handles.into_iter().next() else {
                tracing::debug!(seqnum = header.seqnum, "RET_SUBMIT for unknown/already-cancelled request");
                return Ok(());
            };
            let Some(completion) = device.take_completion(handle) else {
                return Ok(());
            };

            let outcome = if body.number_of_packets != protocol::submit::NON_ISOCH && body.number_of_packets > 0 {
                build_isoch_outcome(&body, &payload, layout_for(endpoint_id))
            } else if body.is_success() {
                let mut data = payload;
                if device.take_descriptor_postprocess(handle) && device.speed == protocol::Speed::Full {
                    protocol::speed::rewrite_full_speed_config_descriptor(&mut data);
                }
                Ok(TransferOutcome::Success { actual_length: body.actual_length, data })
            } else {
                device.take_descriptor_postprocess(handle);
                Err(protocol::kind::kind_from_errno(body.status))
            };

            let _ = completion.send(match outcome {
                Ok(o) => o,
                Err(kind) => TransferOutcome::Error { kind, actual_length: body.actual_length },
            });
            Ok(())
        }
        Pdu::RetUnlink(header, body) => {
            // ECONNRESET here always means "cancellation acknowledged", not
            // a transport failure: the corresponding RET_SUBMIT (already
            // received or still in flight) carries the real outcome.
            tracing::debug!(seqnum = header.seqnum, status = body.status, "RET_UNLINK acknowledged");
            Ok(())
        }
        Pdu::CmdSubmit(..) | Pdu::CmdUnlink(..) => {
            Err(Kind::Protocol)
        }
    }
}

fn build_isoch_outcome(
    body: &protocol::submit::RetSubmitBody,
    payload: &[u8],
    layout: Option<IsochLayout>,
) -> Result<TransferOutcome, Kind> {
    let Some(layout) = layout else {
        return Err(Kind::Protocol);
    };
    let n = body.normalized_number_of_packets();
    let iso_bytes_offset = payload.len().saturating_sub(n as usize * protocol::iso::ISO_PACKET_SIZE);
    let (data, iso_bytes) = payload.split_at(iso_bytes_offset);
    let wire = decode_iso_packets(iso_bytes, n as usize).map_err(|e| e.kind())?;

    let moves = repack_iso_in(&layout.local_packets, &wire, data).map_err(|e| e.kind())?;

    let total_len: usize = layout.local_packets.iter().map(|p| p.length as usize).sum();
    let mut reassembled = vec![0u8; total_len];
    for (offset, bytes) in moves {
        let start = offset as usize;
        reassembled[start..start + bytes.len()].copy_from_slice(&bytes);
    }

    match protocol::iso::quirk_from_error_count(body.error_count, n) {
        protocol::iso::IsochQuirk::AllFailed => Err(Kind::Network),
        protocol::iso::IsochQuirk::None if body.is_success() => {
            Ok(TransferOutcome::Success { actual_length: body.actual_length, data: reassembled })
        }
        protocol::iso::IsochQuirk::None => Err(protocol::kind::kind_from_errno(body.status)),
    }
}

/// Sends a half-close on the write side and drops the read half, used by
/// device teardown once the receive loop has exited (or is about to be
/// abandoned because it's the caller itself).
pub async fn shutdown_write(device: &Device) {
    let mut w = device.write_half.lock().await;
    let _ = w.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_variants_reject_on_receive() {
        // CMD_SUBMIT/CMD_UNLINK should never arrive from the server; the
        // match in `read_one` treats both as a protocol violation.
        assert_eq!(Command::CmdSubmit.to_wire(), 0x0001);
        assert_eq!(Command::CmdUnlink.to_wire(), 0x0002);
    }
}
