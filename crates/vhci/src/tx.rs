//! TX engine (C4): encodes and sends CMD_SUBMIT/CMD_UNLINK PDUs, registers
//! the resulting request so the RX engine can complete it, and serializes
//! all writers onto the device's one socket.
//!
//! Grounded in the original driver's `submit_urb`/`send_cmd_unlink` pair:
//! one lock around the wire write (here, the device's `write_half` mutex,
//! since sending spans an `.await`), seqnum allocated just before the
//! header leaves the node, and the request appended to its endpoint's
//! registry before the bytes are flushed so a same-tick RET_SUBMIT can
//! never race ahead of the append.

use anyhow::{Result, anyhow};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use protocol::header::{Command, CommonHeader, Direction};
use protocol::iso::{LocalIsoPacket, repack_iso_out};
use protocol::submit::{CmdSubmitBody, EndpointDescriptor, NON_ISOCH, Pdu};
use protocol::{Kind, encode_pdu, encode_submit, encode_unlink};

use crate::device::{Device, TransferOutcome};
use crate::endpoint::EndpointId;
use crate::request_registry::RequestSearch;

pub struct TxEngine<'a> {
    device: &'a Device,
}

impl<'a> TxEngine<'a> {
    pub fn new(device: &'a Device) -> Self {
        TxEngine { device }
    }

    /// Submits a control, bulk, or interrupt transfer (anything that isn't
    /// isochronous). `setup_dir` is `Some` only for the default control
    /// pipe, mirroring [`encode_submit`]'s contract.
    pub async fn submit_non_isoch(
        &self,
        endpoint_id: EndpointId,
        epd: EndpointDescriptor,
        setup_dir: Option<bool>,
        setup: [u8; 8],
        transfer_flags: u32,
        out_data: Option<Vec<u8>>,
        in_len: u32,
    ) -> Result<oneshot::Receiver<TransferOutcome>> {
        let transfer_buffer_length = out_data.as_ref().map(|d| d.len() as u32).unwrap_or(in_len);
        let pdu = encode_submit(
            &self.device.seqnum_alloc,
            self.device.devid,
            &epd,
            transfer_flags,
            transfer_buffer_length,
            setup_dir,
            setup,
        )?;
        let needs_descriptor_postprocess = setup_dir == Some(true) && is_get_configuration_descriptor(&setup);
        self.send(pdu, endpoint_id, out_data, needs_descriptor_postprocess).await
    }

    /// Submits an isochronous transfer. `packets` describes each packet's
    /// offset/length in the (uncompacted) local transfer buffer; the wire
    /// descriptor array is produced by [`repack_iso_out`].
    pub async fn submit_isoch(
        &self,
        endpoint_id: EndpointId,
        epd: EndpointDescriptor,
        out_data: Option<Vec<u8>>,
        in_len: u32,
        packets: &[LocalIsoPacket],
    ) -> Result<oneshot::Receiver<TransferOutcome>> {
        let transfer_buffer_length = out_data.as_ref().map(|d| d.len() as u32).unwrap_or(in_len);
        let dir_out = epd.dir_out();
        let wire_packets = repack_iso_out(packets, transfer_buffer_length)?;

        let common = CommonHeader {
            command: Command::CmdSubmit,
            seqnum: self.device.seqnum_alloc.next(!dir_out),
            devid: self.device.devid.raw(),
            direction: if dir_out { Direction::Out } else { Direction::In },
            ep: epd.number(),
        };
        let body = CmdSubmitBody {
            transfer_flags: protocol::flags::to_linux_flags(
                protocol::flags::USBD_START_ISO_TRANSFER_ASAP,
                !dir_out,
            ),
            transfer_buffer_length,
            start_frame: 0,
            number_of_packets: wire_packets.len() as u32,
            interval: epd.interval as u32,
            setup: [0u8; 8],
        };
        let pdu = Pdu::CmdSubmit(common, body);

        let mut payload = out_data.unwrap_or_default();
        for d in &wire_packets {
            d.write(&mut payload)?;
        }
        self.device.set_iso_layout(endpoint_id, packets.to_vec());
        self.send(pdu, endpoint_id, Some(payload), false).await
    }

    async fn send(
        &self,
        pdu: Pdu,
        endpoint_id: EndpointId,
        payload: Option<Vec<u8>>,
        needs_descriptor_postprocess: bool,
    ) -> Result<oneshot::Receiver<TransferOutcome>> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let seqnum = match &pdu {
            Pdu::CmdSubmit(common, _) => common.seqnum,
            _ => return Err(anyhow!("send() only accepts CMD_SUBMIT")),
        };

        let handle = self.device.next_handle();
        self.device
            .endpoints
            .with_registry(endpoint_id, |reg| reg.append(handle, seqnum, endpoint_id))
            .ok_or_else(|| anyhow!("endpoint {} not open", endpoint_id.0))?;
        self.device.register_completion(handle, completion_tx);
        if needs_descriptor_postprocess {
            self.device.mark_descriptor_postprocess(handle);
        }

        if self.device.is_unplugged() {
            self.fail(endpoint_id, handle, Kind::DeviceRemoved);
            return Ok(completion_rx);
        }

        let mut bytes = encode_pdu(&pdu)?;
        if let Some(p) = payload {
            bytes.extend_from_slice(&p);
        }

        let write_result = {
            let mut w = self.device.write_half.lock().await;
            w.write_all(&bytes).await
        };
        if let Err(e) = write_result {
            tracing::warn!(devid = %self.device.devid, error = %e, "submit write failed");
            self.fail(endpoint_id, handle, Kind::Network);
        }

        Ok(completion_rx)
    }

    /// Cancels the request identified by `seqnum_to_cancel`, per §4.4:
    /// marks it cancelable in its endpoint's registry, then sends
    /// CMD_UNLINK if the mark succeeded (a request that already completed
    /// needs no cancellation).
    pub async fn send_cmd_unlink_and_cancel(&self, endpoint_id: EndpointId, seqnum_to_cancel: u32) -> Result<()> {
        let marked = self
            .device
            .endpoints
            .with_registry(endpoint_id, |reg| reg.mark_cancelable(seqnum_to_cancel))
            .unwrap_or(false);
        if !marked {
            return Ok(());
        }

        let pdu = encode_unlink(&self.device.seqnum_alloc, self.device.devid, seqnum_to_cancel);
        let bytes = encode_pdu(&pdu)?;
        let mut w = self.device.write_half.lock().await;
        w.write_all(&bytes).await?;
        Ok(())
    }

    fn fail(&self, endpoint_id: EndpointId, handle: u64, kind: Kind) {
        self.device
            .endpoints
            .with_registry(endpoint_id, |reg| reg.remove(RequestSearch::Handle(handle), false));
        if let Some(tx) = self.device.take_completion(handle) {
            let _ = tx.send(TransferOutcome::Error { kind, actual_length: 0 });
        }
    }
}

/// `number_of_packets` sentinel re-exported for callers distinguishing
/// isoch from non-isoch submissions without depending on `protocol::submit`
/// directly.
pub const NON_ISOCH_SENTINEL: u32 = NON_ISOCH;

const REQUEST_GET_DESCRIPTOR: u8 = 6;
const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;

/// Whether a standard control SETUP packet is a device-to-host
/// GET_DESCRIPTOR(CONFIGURATION) request, the only RET_SUBMIT payload
/// §4.5/§4.6's FULL-speed `bInterval` rewrite applies to.
fn is_get_configuration_descriptor(setup: &[u8; 8]) -> bool {
    let device_to_host = setup[0] & 0x80 != 0;
    let is_get_descriptor = setup[1] == REQUEST_GET_DESCRIPTOR;
    let descriptor_type = setup[3];
    device_to_host && is_get_descriptor && descriptor_type == DESCRIPTOR_TYPE_CONFIGURATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_matches_protocol_constant() {
        assert_eq!(NON_ISOCH_SENTINEL, protocol::submit::NON_ISOCH);
    }

    #[test]
    fn recognizes_get_configuration_descriptor_setup() {
        let setup = [0x80, 6, 0, 0x02, 0, 0, 64, 0];
        assert!(is_get_configuration_descriptor(&setup));
    }

    #[test]
    fn rejects_other_get_descriptor_requests() {
        let device_descriptor = [0x80, 6, 0, 0x01, 0, 0, 18, 0];
        assert!(!is_get_configuration_descriptor(&device_descriptor));
        let host_to_device = [0x00, 6, 0, 0x02, 0, 0, 64, 0];
        assert!(!is_get_configuration_descriptor(&host_to_device));
        let not_get_descriptor = [0x80, 9, 0, 0x02, 0, 0, 64, 0];
        assert!(!is_get_configuration_descriptor(&not_get_descriptor));
    }
}
