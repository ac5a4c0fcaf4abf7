//! USB/IP wire protocol: PDU header and command codec, the OP_REQ_IMPORT /
//! OP_REP_IMPORT handshake, seqnum/devid identifiers, isochronous packet
//! repacking, and the stable [`Kind`] error taxonomy shared by every layer
//! above this crate.
//!
//! This crate performs no I/O; it only encodes and decodes bytes. The
//! caller supplies already-connected sockets and owns the event loop.
//!
//! # Example
//!
//! ```
//! use protocol::{Devid, SeqnumAllocator, submit};
//!
//! let alloc = SeqnumAllocator::new();
//! let epd = submit::EndpointDescriptor { address: 0x81, interval: 0 };
//! let pdu = submit::encode_submit(&alloc, Devid::new(1, 1), &epd, 0, 512, None, [0; 8]).unwrap();
//! let bytes = protocol::encode_pdu(&pdu).unwrap();
//! assert_eq!(bytes.len(), protocol::HEADER_SIZE);
//! ```

pub mod buffer;
pub mod devid;
pub mod flags;
pub mod handshake;
pub mod header;
pub mod iso;
pub mod kind;
pub mod seqnum;
pub mod speed;
pub mod submit;
pub mod vhci_error;

pub use devid::Devid;
pub use handshake::{decode_rep_import, encode_req_import, DeviceRecord, USBIP_VERSION};
pub use header::{Command, CommonHeader, Direction, HEADER_SIZE};
pub use iso::{quirk_from_error_count, repack_iso_in, repack_iso_out, IsoPacketDescriptor, IsochQuirk, ISO_PACKET_SIZE};
pub use kind::Kind;
pub use seqnum::SeqnumAllocator;
pub use speed::{remap_full_speed_binterval, rewrite_full_speed_config_descriptor, Speed};
pub use submit::{decode_pdu, encode_pdu, encode_submit, encode_unlink, get_payload_size, Pdu};
pub use vhci_error::{Result, VhciError};
