//! Multicast handshake forging.
//!
//! The multicast bearer pre-shares a 32-byte magic used in place of every
//! negotiated key. The transport engine still expects to see both sides of a
//! handshake, so this module fabricates the peer's contribution: long-header
//! Initial/Handshake packets carrying the magic as crypto data, a short-header
//! stream-0 packet, and — on the server — a synthetic ACK reflected for every
//! outbound packet, so the engine's recovery machinery believes the bearer
//! has a reverse path.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::buffer::Segment;
use crate::config::HANDSHAKE_ANCHOR_STREAM_ID;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::session::Session;
use crate::transport::CryptoLevel;
use crate::varint;

/// The pre-shared secret standing in for every key, IV and header-protection
/// mask on the multicast bearer.
pub const MULTICAST_MAGIC: [u8; 32] = *b"hqm-05 pre-shared session magic!";

/// QUIC version written into fabricated long headers.
const FAKE_VERSION: u32 = 0x0000_0001;

/// Minimum ACK body length; shorter packets would starve header-protection
/// sampling.
const MIN_ACK_BODY_LEN: usize = 16;

/// Long-header packet types.
const LONG_INITIAL: u8 = 0xc0;
const LONG_HANDSHAKE: u8 = 0xe0;

/// Reconstruct a full packet number from its truncated low bits.
///
/// `bits` is the width carried on the wire (8, 16 or 32). The high bits come
/// from the last number seen; if the naive combination went backwards, the
/// window advances by one wrap of the mask.
pub fn expand_pkt_num(last: u64, truncated: u64, bits: u32) -> u64 {
    let mask = (1u64 << bits) - 1;
    let candidate = (last & !mask) | (truncated & mask);
    if candidate < last {
        candidate + mask + 1
    } else {
        candidate
    }
}

/// Fabricate a long-header packet at `ptype` carrying the magic as a CRYPTO
/// frame. The session id serves as both connection ids.
fn fake_long_header_packet(ptype: u8, session_id: &[u8]) -> Bytes {
    let mut payload = BytesMut::new();
    varint::encode(0x06, &mut payload); // CRYPTO
    varint::encode(0, &mut payload); // offset
    varint::encode(MULTICAST_MAGIC.len() as u64, &mut payload);
    payload.extend_from_slice(&MULTICAST_MAGIC);

    let mut pkt = BytesMut::new();
    pkt.put_u8(ptype);
    pkt.put_u32(FAKE_VERSION);
    pkt.put_u8(session_id.len() as u8);
    pkt.extend_from_slice(session_id);
    pkt.put_u8(session_id.len() as u8);
    pkt.extend_from_slice(session_id);
    if ptype == LONG_INITIAL {
        varint::encode(0, &mut pkt); // token length
    }
    varint::encode(1 + payload.len() as u64, &mut pkt); // pkt num + payload
    pkt.put_u8(0x00); // pkt num 0
    pkt.extend_from_slice(&payload);
    pkt.freeze()
}

pub(crate) fn fake_client_initial(session_id: &[u8]) -> Bytes {
    fake_long_header_packet(LONG_INITIAL, session_id)
}

pub(crate) fn fake_server_initial(session_id: &[u8]) -> Bytes {
    fake_long_header_packet(LONG_INITIAL, session_id)
}

pub(crate) fn fake_server_handshake(session_id: &[u8]) -> Bytes {
    fake_long_header_packet(LONG_HANDSHAKE, session_id)
}

/// Fabricate the short-header stream-0 packet that provokes the engine's
/// first real ACK slot: a STREAM frame for the anchor stream carrying a
/// zero-length body frame.
pub(crate) fn fake_stream0_packet(session_id: &[u8]) -> Bytes {
    let body = Frame::Data {
        payload: Bytes::new(),
    }
    .encode();

    let mut pkt = BytesMut::new();
    pkt.put_u8(0x40);
    pkt.extend_from_slice(session_id);
    pkt.put_u8(0x00); // pkt num 0
    varint::encode(0x0a, &mut pkt); // STREAM with LEN bit
    varint::encode(HANDSHAKE_ANCHOR_STREAM_ID, &mut pkt);
    varint::encode(body.len() as u64, &mut pkt);
    pkt.extend_from_slice(&body);
    pkt.freeze()
}

/// Build the synthetic ACK for one outbound short-header packet.
///
/// Layout: fixed byte 0x40, the connection id copied from the packet, a
/// one-byte packet number from the fabricated peer's counter, then an ACK
/// frame whose largest-ack is the reconstructed full number of the packet
/// being reflected. The ACK body is padded to at least 16 bytes.
///
/// Long-header packets (the forged handshake flight) are not reflected.
pub(crate) fn synthetic_ack(
    pkt: &[u8],
    cid_len: usize,
    last_remote_pkt_num: &mut u64,
    remote_pktnum: &mut u64,
) -> Option<Bytes> {
    let first = *pkt.first()?;
    if first & 0x80 != 0 {
        return None;
    }
    let pn_len = ((first & 0x03) + 1) as usize;
    let pn_bytes = pkt.get(1 + cid_len..1 + cid_len + pn_len)?;
    let truncated = pn_bytes.iter().fold(0u64, |v, b| (v << 8) | u64::from(*b));
    let full = expand_pkt_num(*last_remote_pkt_num, truncated, 8 * pn_len as u32);
    *last_remote_pkt_num = full;

    let mut ack = BytesMut::new();
    ack.put_u8(0x40);
    ack.extend_from_slice(&pkt[1..1 + cid_len]);
    ack.put_u8(*remote_pktnum as u8);
    let body_start = ack.len();
    varint::encode(0x02, &mut ack); // ACK
    varint::encode(full, &mut ack); // largest acknowledged
    varint::encode(0, &mut ack); // ack delay
    varint::encode(0, &mut ack); // range count
    varint::encode(0, &mut ack); // first range
    while ack.len() - body_start < MIN_ACK_BODY_LEN {
        ack.put_u8(0x00);
    }
    *remote_pktnum += 1;

    trace!(largest_ack = full, "reflected synthetic ack");
    Some(ack.freeze())
}

impl Session {
    /// Drive the engine through a fabricated handshake, client side.
    pub(crate) fn forge_client_handshake(&mut self) -> Result<()> {
        debug!("forging multicast client handshake");
        let sid = self.session_id.clone();

        self.engine
            .install_keys(CryptoLevel::Initial, &MULTICAST_MAGIC)
            .map_err(Error::from)?;
        self.engine
            .install_keys(CryptoLevel::Handshake, &MULTICAST_MAGIC)
            .map_err(Error::from)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Initial, &MULTICAST_MAGIC)
            .map_err(Error::from)?;

        // One engine write emits our client-initial packet.
        let mut pkt = Vec::new();
        self.engine
            .write_stream(HANDSHAKE_ANCHOR_STREAM_ID, &[], false, &mut pkt)
            .map_err(Error::from)?;
        if !pkt.is_empty() {
            self.emit_packet(pkt)?;
        }

        // Hand-feed the server's half of the handshake.
        let events = self
            .engine
            .read_pkt(&fake_server_initial(&sid))
            .map_err(Error::from)?;
        self.process_events(events)?;
        let events = self
            .engine
            .read_pkt(&fake_server_handshake(&sid))
            .map_err(Error::from)?;
        self.process_events(events)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Handshake, &MULTICAST_MAGIC)
            .map_err(Error::from)?;

        self.handshake_complete = true;
        self.engine.handshake_completed();
        self.engine
            .install_keys(CryptoLevel::Application, &MULTICAST_MAGIC)
            .map_err(Error::from)?;

        // Commit the handshake: a zero-length body frame on the anchor stream.
        if let Some(anchor) = self.transfers.find_mut(HANDSHAKE_ANCHOR_STREAM_ID) {
            anchor.queue_frame_bytes(
                Frame::Data {
                    payload: Bytes::new(),
                }
                .encode(),
                false,
            );
        }
        match self.scheduler_run() {
            Ok(_) => Ok(()),
            Err(Error::SessionBlocked) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drive the engine through a fabricated handshake, server side.
    pub(crate) fn forge_server_handshake(&mut self) -> Result<()> {
        debug!("forging multicast server handshake");
        let sid = self.session_id.clone();

        let events = self
            .engine
            .read_pkt(&fake_client_initial(&sid))
            .map_err(Error::from)?;
        self.process_events(events)?;

        self.engine
            .install_keys(CryptoLevel::Handshake, &MULTICAST_MAGIC)
            .map_err(Error::from)?;
        self.engine
            .install_keys(CryptoLevel::Application, &MULTICAST_MAGIC)
            .map_err(Error::from)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Initial, &MULTICAST_MAGIC)
            .map_err(Error::from)?;
        self.engine
            .submit_crypto_data(CryptoLevel::Handshake, &MULTICAST_MAGIC)
            .map_err(Error::from)?;

        // Drain the server-side handshake flight.
        loop {
            let mut pkt = Vec::new();
            let n = self.engine.write_pkt(&mut pkt).map_err(Error::from)?;
            if n == 0 {
                break;
            }
            self.emit_packet(pkt)?;
        }

        self.handshake_complete = true;
        self.engine.handshake_completed();
        // The on-wire fiction has no AEAD expansion.
        self.engine.set_aead_overhead(0);

        let events = self
            .engine
            .read_pkt(&fake_stream0_packet(&sid))
            .map_err(Error::from)?;
        self.process_events(events)?;
        Ok(())
    }

    /// Reflect an outbound packet as a synthetic ACK onto the receive queue.
    pub(crate) fn reflect_ack(&mut self, pkt: &[u8]) {
        let cid_len = self.session_id.len();
        if let Some(ack) = synthetic_ack(
            pkt,
            cid_len,
            &mut self.last_remote_pkt_num,
            &mut self.remote_pktnum,
        ) {
            self.recv_queue.push(Segment::from_bytes(ack, 0, false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_num_expansion_moves_forward() {
        // The documented case: last 0x01ff, truncated byte 0x00 -> 0x0200.
        assert_eq!(expand_pkt_num(0x01ff, 0x00, 8), 0x0200);
        // A value strictly behind the last one advances a whole window.
        assert_eq!(expand_pkt_num(0x01ff, 0xfe, 8), 0x02fe);
        assert_eq!(expand_pkt_num(0x01ff, 0xff, 8), 0x01ff);
        assert_eq!(expand_pkt_num(0, 0x05, 8), 0x05);
        assert_eq!(expand_pkt_num(0x1_0000, 0x0001, 16), 0x1_0001);
    }

    #[test]
    fn synthetic_ack_shape() {
        // Short-header packet: 0x40, 8-byte cid, pkt num 0x07, payload.
        let cid = [0xaa; 8];
        let mut pkt = vec![0x40];
        pkt.extend_from_slice(&cid);
        pkt.push(0x07);
        pkt.extend_from_slice(b"payload");

        let mut last = 0u64;
        let mut remote = 2u64;
        let ack = synthetic_ack(&pkt, cid.len(), &mut last, &mut remote).unwrap();

        assert_eq!(ack[0], 0x40);
        assert_eq!(&ack[1..9], &cid);
        assert_eq!(ack[9], 0x02); // fabricated peer's pkt num
        assert_eq!(ack[10], 0x02); // ACK frame type
        assert_eq!(ack[11], 0x07); // largest ack = expanded pkt num
        assert!(ack.len() - 10 >= MIN_ACK_BODY_LEN);
        assert_eq!(last, 0x07);
        assert_eq!(remote, 3);
    }

    #[test]
    fn long_header_packets_are_not_reflected() {
        let pkt = fake_client_initial(b"12345678");
        let mut last = 0;
        let mut remote = 0;
        assert!(synthetic_ack(&pkt, 8, &mut last, &mut remote).is_none());
    }

    #[test]
    fn fake_initial_carries_magic() {
        let pkt = fake_client_initial(b"abcd");
        assert_eq!(pkt[0], LONG_INITIAL);
        assert_eq!(&pkt[1..5], &FAKE_VERSION.to_be_bytes());
        let magic_at = pkt.len() - MULTICAST_MAGIC.len();
        assert_eq!(&pkt[magic_at..], &MULTICAST_MAGIC);
    }

    #[test]
    fn fake_stream0_targets_anchor_stream() {
        let pkt = fake_stream0_packet(b"abcd");
        assert_eq!(pkt[0], 0x40);
        // After cid (4) and pkt num (1): STREAM frame type, stream id 0.
        assert_eq!(pkt[5], 0x0a);
        assert_eq!(pkt[6], 0x00);
    }
}
