//! Sysex-style wire framing shared by the host loader and the device.
//!
//! Every request and response travels as
//! `START_SYSEX, SCHEDULER_DATA, 0xFF, sub-command, payload, END_SYSEX`.
//! Payload bytes are split into pairs of 7-bit halves (low seven bits first)
//! so the high bit never appears mid-frame; multi-byte integers are encoded
//! little-endian, one pair per byte.

use core::fmt;

use crate::{ExecState, ExecutionError, ExecutorCommand};

/// Start-of-frame marker.
pub const START_SYSEX: u8 = 0xf0;
/// End-of-frame marker.
pub const END_SYSEX: u8 = 0xf7;
/// Channel byte of the scheduler/executor feature.
pub const SCHEDULER_DATA: u8 = 0x7b;
/// Message type marker following the channel byte in requests.
pub const EXECUTOR_MESSAGE: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Malformed-frame conditions. All of them map to a protocol Nack and leave
/// the engine state unchanged.
pub enum WireError {
    /// The frame ended in the middle of a value.
    UnexpectedEnd,
    /// A payload byte had its high bit set.
    HighBitSet(u8),
    /// The frame markers or channel bytes are wrong.
    BadFraming,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "frame truncated"),
            Self::HighBitSet(b) => write!(f, "payload byte {b:#04x} has the high bit set"),
            Self::BadFraming => write!(f, "bad frame markers"),
        }
    }
}

impl std::error::Error for WireError {}

/// Append one raw byte as a 7-bit pair.
pub fn push_pair(out: &mut Vec<u8>, byte: u8) {
    out.push(byte & 0x7f);
    out.push(byte >> 7);
}

#[derive(Debug, Default, Clone)]
/// Writes 7-bit encoded payload bytes.
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// New empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one byte as a 7-bit pair.
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        push_pair(&mut self.buf, value);
        self
    }

    /// Encode a 16-bit integer, little-endian.
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Encode a 32-bit integer, little-endian.
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Encode a 64-bit integer, little-endian.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Encode a run of raw bytes, one pair each.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for &b in bytes {
            push_pair(&mut self.buf, b);
        }
        self
    }

    /// The encoded payload.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Borrow the encoded payload.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[derive(Debug, Clone, Copy)]
/// Reads 7-bit encoded payload bytes.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Decoder over an encoded payload region.
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of decoded bytes remaining.
    pub const fn remaining(&self) -> usize {
        (self.data.len() - self.pos) / 2
    }

    /// True once the payload is exhausted.
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Decode one byte from its 7-bit pair.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        let lo = *self.data.get(self.pos).ok_or(WireError::UnexpectedEnd)?;
        let hi = *self.data.get(self.pos + 1).ok_or(WireError::UnexpectedEnd)?;
        if lo & 0x80 != 0 {
            return Err(WireError::HighBitSet(lo));
        }
        if hi & 0x80 != 0 {
            return Err(WireError::HighBitSet(hi));
        }
        self.pos += 2;
        Ok(lo | (hi << 7))
    }

    /// Decode a little-endian 16-bit integer.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes([self.read_u8()?, self.read_u8()?]))
    }

    /// Decode a little-endian 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut bytes = [0u8; 4];
        for b in bytes.iter_mut() {
            *b = self.read_u8()?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Decode a little-endian 64-bit integer.
    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut() {
            *b = self.read_u8()?;
        }
        Ok(u64::from_le_bytes(bytes))
    }

    /// Decode all remaining bytes.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(self.remaining());
        while self.pos + 1 < self.data.len() {
            out.push(self.read_u8()?);
        }
        if self.pos != self.data.len() {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(out)
    }
}

/// Build a request frame for `command` with an already-encoded payload.
pub fn request_frame(command: ExecutorCommand, payload: &Encoder) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.as_slice().len() + 5);
    frame.push(START_SYSEX);
    frame.push(SCHEDULER_DATA);
    frame.push(EXECUTOR_MESSAGE);
    frame.push(command as u8);
    frame.extend_from_slice(payload.as_slice());
    frame.push(END_SYSEX);
    frame
}

/// Split a request frame into its sub-command and encoded payload region.
pub fn parse_request(frame: &[u8]) -> Result<(ExecutorCommand, &[u8]), WireError> {
    if frame.len() < 5 {
        return Err(WireError::BadFraming);
    }
    if frame[0] != START_SYSEX || frame[frame.len() - 1] != END_SYSEX {
        return Err(WireError::BadFraming);
    }
    if frame[1] != SCHEDULER_DATA || frame[2] != EXECUTOR_MESSAGE {
        return Err(WireError::BadFraming);
    }
    let command = ExecutorCommand::from(frame[3]);
    if command == ExecutorCommand::None {
        return Err(WireError::BadFraming);
    }
    Ok((command, &frame[4..frame.len() - 1]))
}

/// Build an Ack or Nack response frame.
pub fn response_frame(ack: bool, command: ExecutorCommand, error: ExecutionError) -> Vec<u8> {
    let marker = if ack { ExecutorCommand::Ack } else { ExecutorCommand::Nack };
    vec![
        START_SYSEX,
        SCHEDULER_DATA,
        marker as u8,
        command as u8,
        error as u8,
        END_SYSEX,
    ]
}

/// Build an execution-result frame: code reference, final state and the
/// result slot serialized as `(kind, size, payload bytes)`.
pub fn execution_result_frame(code_reference: u8, state: ExecState, result: &Encoder) -> Vec<u8> {
    let arg_count = if result.as_slice().is_empty() { 0 } else { 1 };
    let mut frame = Vec::with_capacity(result.as_slice().len() + 6);
    frame.push(START_SYSEX);
    frame.push(SCHEDULER_DATA);
    frame.push(code_reference & 0x7f);
    frame.push(state as u8);
    frame.push(arg_count);
    frame.extend_from_slice(result.as_slice());
    frame.push(END_SYSEX);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn u32_round_trip(value: u32) -> bool {
        let mut enc = Encoder::new();
        enc.write_u32(value);
        let payload = enc.finish();
        payload.iter().all(|b| b & 0x80 == 0) && Decoder::new(&payload).read_u32() == Ok(value)
    }

    #[quickcheck]
    fn u64_round_trip(value: u64) -> bool {
        let mut enc = Encoder::new();
        enc.write_u64(value);
        Decoder::new(&enc.finish()).read_u64() == Ok(value)
    }

    #[quickcheck]
    fn bytes_round_trip(data: Vec<u8>) -> bool {
        let mut enc = Encoder::new();
        enc.write_bytes(&data);
        Decoder::new(&enc.finish()).read_to_end() == Ok(data)
    }

    #[test]
    fn request_frame_round_trip() {
        let mut enc = Encoder::new();
        enc.write_u32(0x0600_0001).write_u8(3);
        let frame = request_frame(ExecutorCommand::DeclareMethod, &enc);

        let (command, payload) = parse_request(&frame).unwrap();
        assert_eq!(command, ExecutorCommand::DeclareMethod);
        let mut dec = Decoder::new(payload);
        assert_eq!(dec.read_u32(), Ok(0x0600_0001));
        assert_eq!(dec.read_u8(), Ok(3));
        assert!(dec.is_empty());
    }

    #[test]
    fn malformed_frames_rejected() {
        assert_eq!(parse_request(&[]), Err(WireError::BadFraming));
        assert_eq!(
            parse_request(&[START_SYSEX, SCHEDULER_DATA, EXECUTOR_MESSAGE, 1]),
            Err(WireError::BadFraming)
        );
        // Unknown sub-command byte.
        let frame = [START_SYSEX, SCHEDULER_DATA, EXECUTOR_MESSAGE, 0x55, END_SYSEX];
        assert_eq!(parse_request(&frame), Err(WireError::BadFraming));
        // Truncated payload pair.
        let mut dec = Decoder::new(&[0x01]);
        assert_eq!(dec.read_u8(), Err(WireError::UnexpectedEnd));
        // Stray high bit.
        let mut dec = Decoder::new(&[0x81, 0x00]);
        assert_eq!(dec.read_u8(), Err(WireError::HighBitSet(0x81)));
    }
}
