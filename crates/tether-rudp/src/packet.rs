//! Wire codec for the reliable datagram stream
//!
//! Header layout (all integers big-endian):
//!
//! ```text
//! channel:u16 | flags:u8 | vector_len:u8 | seq:u48 | gsnr:u48 | gsnfr:u48 | vector | payload
//! ```
//!
//! Sequence numbers are carried as their lower 48 bits and extended against
//! a local reference counter on reception.

use bytes::{Buf, BufMut};

/// Fixed header length in bytes
pub(crate) const HEADER_LEN: usize = 2 + 1 + 1 + 6 + 6 + 6;

/// Upper bound for the run-length encoded ACK vector
pub(crate) const MAX_VECTOR_LENGTH: usize = 126;

const SEQUENCE_MASK: u64 = (1 << 48) - 1;

/// Header flags of a stream packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    /// Parity of this packet
    pub const PS_PARITY_SENDING: u8 = 0x80;
    /// Parity of the packet that moved GSNR
    pub const PG_PARITY_GSNR: u8 = 0x40;
    /// XORed parity of every packet up to & including GSNFR
    pub const XP_XORED_PARITY_TO_GSNFR: u8 = 0x20;
    /// A duplicate packet was received since the last report
    pub const DP_DUPLICATE_PACKET: u8 = 0x10;
    /// An ECN marked packet was received since the last report
    pub const EC_ECN_PACKET: u8 = 0x08;
    /// The sender asks for an immediate ACK
    pub const AR_ACK_REQUIRED: u8 = 0x04;
    /// XORed parity of every received packet reported in the vector
    pub const VP_VECTOR_PARITY: u8 = 0x02;

    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// A parsed stream packet, sequence numbers still in their 48 bit wire form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RudpPacket {
    pub channel: u16,
    pub flags: Flags,
    raw_sequence_number: u64,
    raw_gsnr: u64,
    raw_gsnfr: u64,
    pub vector: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is truncated")]
    Truncated,
    #[error("vector length exceeds limit")]
    VectorTooLong,
}

impl RudpPacket {
    pub fn parse(mut data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::Truncated);
        }

        let channel = data.get_u16();
        let flags = Flags(data.get_u8());
        let vector_len = usize::from(data.get_u8());
        let raw_sequence_number = data.get_uint(6);
        let raw_gsnr = data.get_uint(6);
        let raw_gsnfr = data.get_uint(6);

        if vector_len > MAX_VECTOR_LENGTH {
            return Err(PacketError::VectorTooLong);
        }

        if data.remaining() < vector_len {
            return Err(PacketError::Truncated);
        }

        let vector = data[..vector_len].to_vec();
        data.advance(vector_len);

        Ok(RudpPacket {
            channel,
            flags,
            raw_sequence_number,
            raw_gsnr,
            raw_gsnfr,
            vector,
            payload: data.to_vec(),
        })
    }

    /// Sequence number of this packet, extended against the receiver's GSNR
    pub fn sequence_number(&self, reference: u64) -> u64 {
        extend_sequence_number(reference, self.raw_sequence_number)
    }

    /// The sender's GSNR, extended against the local sending sequence number
    pub fn gsnr(&self, reference: u64) -> u64 {
        extend_sequence_number(reference, self.raw_gsnr)
    }

    /// The sender's GSNFR, extended against the local sending sequence number
    pub fn gsnfr(&self, reference: u64) -> u64 {
        extend_sequence_number(reference, self.raw_gsnfr)
    }

    pub fn serialize(
        channel: u16,
        flags: Flags,
        sequence_number: u64,
        gsnr: u64,
        gsnfr: u64,
        vector: &[u8],
        payload: &[u8],
    ) -> Vec<u8> {
        assert!(vector.len() <= MAX_VECTOR_LENGTH);

        let mut buf = Vec::with_capacity(HEADER_LEN + vector.len() + payload.len());

        buf.put_u16(channel);
        buf.put_u8(flags.0);
        buf.put_u8(vector.len() as u8);
        buf.put_uint(sequence_number & SEQUENCE_MASK, 6);
        buf.put_uint(gsnr & SEQUENCE_MASK, 6);
        buf.put_uint(gsnfr & SEQUENCE_MASK, 6);
        buf.extend_from_slice(vector);
        buf.extend_from_slice(payload);

        buf
    }
}

/// Extend a 48 bit wire counter to the full u64 value closest to `reference`
pub(crate) fn extend_sequence_number(reference: u64, got: u64) -> u64 {
    const MAX: u64 = 1 << 48;

    let mul = (reference / MAX).saturating_sub(1);

    let low = mul * MAX + got;
    let high = (mul + 1) * MAX + got;

    if low.abs_diff(reference) < high.abs_diff(reference) {
        low
    } else {
        high
    }
}

/// Per-packet receive state reported inside an ACK vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VectorState {
    Received = 0x00,
    ReceivedEcnMarked = 0x40,
    NotReceived = 0x80,
}

const VECTOR_STATE_MASK: u8 = 0xC0;
const VECTOR_RUN_MASK: u8 = 0x3F;
const MAX_RUN_LENGTH: u8 = 0x3F;

/// Run-length encoder for the gap vector between GSNFR+1 and GSNR-1
///
/// Every added entry describes one packet; equal consecutive states are
/// folded into a single byte. The parity of every reported-received packet
/// is folded into the vector parity flag.
pub(crate) struct VectorEncoder {
    max_length: usize,
    bytes: Vec<u8>,
    run: Option<(VectorState, u8)>,
    parity: bool,
}

impl VectorEncoder {
    pub(crate) fn new(initial_parity: bool, max_length: usize) -> Self {
        VectorEncoder {
            max_length,
            bytes: Vec::new(),
            run: None,
            parity: initial_parity,
        }
    }

    /// Returns false once the vector is out of capacity, the entry is
    /// dropped in that case
    pub(crate) fn add(&mut self, state: VectorState, parity: bool) -> bool {
        match &mut self.run {
            Some((run_state, run_length)) if *run_state == state && *run_length < MAX_RUN_LENGTH => {
                *run_length += 1;
            }
            Some(_) => {
                // run break: the pending run needs a byte plus room must
                // remain for the new run
                if self.bytes.len() + 2 > self.max_length {
                    return false;
                }

                let (run_state, run_length) = self.run.take().unwrap();
                self.bytes.push(run_state as u8 | run_length);
                self.run = Some((state, 1));
            }
            None => {
                if self.max_length == 0 {
                    return false;
                }

                self.run = Some((state, 1));
            }
        }

        if matches!(state, VectorState::Received | VectorState::ReceivedEcnMarked) {
            self.parity ^= parity;
        }

        true
    }

    /// Returns the encoded vector and the accumulated vector parity
    pub(crate) fn finalize(mut self) -> (Vec<u8>, bool) {
        if let Some((run_state, run_length)) = self.run.take() {
            self.bytes.push(run_state as u8 | run_length);
        }

        (self.bytes, self.parity)
    }
}

/// Iterator over the per-packet states of a received ACK vector
pub(crate) struct VectorDecoder<'a> {
    bytes: &'a [u8],
    run: Option<(VectorState, u8)>,
}

impl<'a> VectorDecoder<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        VectorDecoder { bytes, run: None }
    }
}

impl Iterator for VectorDecoder<'_> {
    type Item = VectorState;

    fn next(&mut self) -> Option<VectorState> {
        loop {
            if let Some((state, remaining)) = &mut self.run {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Some(*state);
                }

                self.run = None;
            }

            let (&byte, rest) = self.bytes.split_first()?;
            self.bytes = rest;

            let run_length = byte & VECTOR_RUN_MASK;
            if run_length == 0 {
                // terminator
                self.bytes = &[];
                return None;
            }

            let state = match byte & VECTOR_STATE_MASK {
                0x00 => VectorState::Received,
                0x40 => VectorState::ReceivedEcnMarked,
                _ => VectorState::NotReceived,
            };

            self.run = Some((state, run_length));
        }
    }
}
