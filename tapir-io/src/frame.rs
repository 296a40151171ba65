//! Register-bus wire frames.
//!
//! Every request starts with a sequence number and an opcode, followed by a
//! little-endian 16-bit register address:
//!
//! ```text
//! read         : seq 02 addr_lo addr_hi
//! write        : seq 01 addr_lo addr_hi v0 v1 v2 v3
//! stream write : seq 03 addr_lo addr_hi len_lo len_hi data...
//! stream read  : seq 04 addr_lo addr_hi len_lo len_hi
//! flush        : seq ff
//! ```
//!
//! Replies carry no length, the requester knows what to expect:
//!
//! ```text
//! read         : echo echo v0 v1 v2 v3
//! write        : ack ack
//! stream write : ack ack
//! stream read  : echo echo data...
//! ```
//!
//! The sequence number only exists to correlate frames in traces.

use crate::{Buffer, Error, Result, bits};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum OpCode {
    Write = 0x01,
    Read = 0x02,
    StreamWrite = 0x03,
    StreamRead = 0x04,
    Flush = 0xff,
}

/// Address `0xffff` is reserved.
pub const ADDRESS_LIMIT: u32 = u16::MAX as u32;
pub const MAX_STREAM_LEN: usize = u16::MAX as usize;

pub const READ_LEN: usize = 4;
pub const WRITE_LEN: usize = 8;
pub const STREAM_HEADER_LEN: usize = 6;
pub const FLUSH_LEN: usize = 2;

pub const ECHO_LEN: usize = 2;
pub const ACK_LEN: usize = 2;
pub const VALUE_LEN: usize = 4;
pub const READ_REPLY_LEN: usize = ECHO_LEN + VALUE_LEN;

pub fn check_address(address: u32) -> Result<u16> {
    if address >= ADDRESS_LIMIT {
        return Err(Error::invalid_parameter(format!(
            "register address {address:#x} out of range"
        )));
    }
    Ok(address as u16)
}

pub fn check_stream_len(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        Error::invalid_parameter(format!(
            "stream length {len} exceeds {MAX_STREAM_LEN} bytes"
        ))
    })
}

pub fn encode_read(seq: u8, address: u32) -> Result<[u8; READ_LEN]> {
    let [a0, a1] = check_address(address)?.to_le_bytes();
    Ok([seq, OpCode::Read as u8, a0, a1])
}

pub fn encode_write(seq: u8, address: u32, value: u32) -> Result<[u8; WRITE_LEN]> {
    let [a0, a1] = check_address(address)?.to_le_bytes();
    let [v0, v1, v2, v3] = value.to_le_bytes();
    Ok([seq, OpCode::Write as u8, a0, a1, v0, v1, v2, v3])
}

pub fn encode_stream_read(seq: u8, address: u32, len: usize) -> Result<[u8; STREAM_HEADER_LEN]> {
    stream_header(seq, OpCode::StreamRead, address, len)
}

pub fn encode_stream_write(seq: u8, address: u32, data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(STREAM_HEADER_LEN + data.len());
    write_stream_write_into(&mut buf, seq, address, data)?;
    Ok(buf)
}

pub fn encode_flush(seq: u8) -> [u8; FLUSH_LEN] {
    [seq, OpCode::Flush as u8]
}

/// Append a write frame to `buf`. Nothing is appended on error.
pub fn write_write_into(buf: &mut dyn Buffer, seq: u8, address: u32, value: u32) -> Result<()> {
    let frame = encode_write(seq, address, value)?;
    buf.extend(WRITE_LEN).copy_from_slice(&frame);
    Ok(())
}

/// Append a stream write frame to `buf`. Nothing is appended on error.
pub fn write_stream_write_into(
    buf: &mut dyn Buffer,
    seq: u8,
    address: u32,
    data: &[u8],
) -> Result<()> {
    let header = stream_header(seq, OpCode::StreamWrite, address, data.len())?;
    let dst = buf.extend(STREAM_HEADER_LEN + data.len());
    let (head, payload) = dst.split_at_mut(STREAM_HEADER_LEN);
    head.copy_from_slice(&header);
    payload.copy_from_slice(data);
    Ok(())
}

fn stream_header(
    seq: u8,
    op: OpCode,
    address: u32,
    len: usize,
) -> Result<[u8; STREAM_HEADER_LEN]> {
    let [a0, a1] = check_address(address)?.to_le_bytes();
    let [l0, l1] = check_stream_len(len)?.to_le_bytes();
    Ok([seq, op as u8, a0, a1, l0, l1])
}

pub fn decode_read_response(bytes: &[u8]) -> Result<u32> {
    bits::load_u32_le(bytes).ok_or_else(|| {
        Error::protocol(format!(
            "read value must be {VALUE_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

pub fn decode_write_ack(bytes: &[u8]) -> Result<()> {
    if bytes.len() != ACK_LEN {
        return Err(Error::protocol(format!(
            "ack must be {ACK_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Strip the echo from a stream read reply.
pub fn decode_stream_read_response(bytes: &[u8], len: usize) -> Result<&[u8]> {
    match bytes.split_at_checked(ECHO_LEN) {
        Some((_, data)) if data.len() == len => Ok(data),
        _ => Err(Error::protocol(format!(
            "stream read reply must be {} bytes, got {}",
            ECHO_LEN + len,
            bytes.len()
        ))),
    }
}

/// A decoded request, as seen by the device side of the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Read { seq: u8, address: u16 },
    Write { seq: u8, address: u16, value: u32 },
    StreamRead { seq: u8, address: u16, len: u16 },
    StreamWrite { seq: u8, address: u16, data: &'a [u8] },
    Flush { seq: u8 },
}

impl<'a> Request<'a> {
    /// Parse the first request in `bytes`, returning it and the remainder.
    pub fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8])> {
        let short = || Error::protocol(format!("truncated request: {} bytes", bytes.len()));

        let [seq, op, rest @ ..] = bytes else {
            return Err(short());
        };
        let seq = *seq;
        let op = OpCode::from_repr(*op)
            .ok_or_else(|| Error::protocol(format!("unknown opcode {op:#04x}")))?;

        if op == OpCode::Flush {
            return Ok((Self::Flush { seq }, rest));
        }
        let [a0, a1, rest @ ..] = rest else {
            return Err(short());
        };
        let address = u16::from_le_bytes([*a0, *a1]);

        match op {
            OpCode::Read => Ok((Self::Read { seq, address }, rest)),
            OpCode::Write => {
                let (value, rest) = rest.split_first_chunk::<VALUE_LEN>().ok_or_else(short)?;
                let value = u32::from_le_bytes(*value);
                Ok((Self::Write { seq, address, value }, rest))
            }
            OpCode::StreamRead | OpCode::StreamWrite => {
                let (len, rest) = rest.split_first_chunk::<2>().ok_or_else(short)?;
                let len = u16::from_le_bytes(*len);
                if op == OpCode::StreamRead {
                    return Ok((Self::StreamRead { seq, address, len }, rest));
                }
                let (data, rest) = rest.split_at_checked(len.into()).ok_or_else(short)?;
                Ok((Self::StreamWrite { seq, address, data }, rest))
            }
            OpCode::Flush => unreachable!(),
        }
    }

    pub fn seq(&self) -> u8 {
        match *self {
            Self::Read { seq, .. }
            | Self::Write { seq, .. }
            | Self::StreamRead { seq, .. }
            | Self::StreamWrite { seq, .. }
            | Self::Flush { seq } => seq,
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Read { .. } => OpCode::Read,
            Self::Write { .. } => OpCode::Write,
            Self::StreamRead { .. } => OpCode::StreamRead,
            Self::StreamWrite { .. } => OpCode::StreamWrite,
            Self::Flush { .. } => OpCode::Flush,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_layout() {
        assert_eq!(encode_read(7, 0x1234).unwrap(), [7, 0x02, 0x34, 0x12]);
        assert_eq!(encode_read(0, 0xfffe).unwrap(), [0, 0x02, 0xfe, 0xff]);
    }

    #[test]
    fn write_layout() {
        assert_eq!(
            encode_write(0xff, 0x0104, 0xdead_beef).unwrap(),
            [0xff, 0x01, 0x04, 0x01, 0xef, 0xbe, 0xad, 0xde]
        );
    }

    #[test]
    fn stream_layout() {
        assert_eq!(
            encode_stream_read(1, 0x3c, 0x0102).unwrap(),
            [1, 0x04, 0x3c, 0x00, 0x02, 0x01]
        );
        assert_eq!(
            encode_stream_write(2, 0x24, &[0xaa, 0xbb, 0xcc]).unwrap(),
            [2, 0x03, 0x24, 0x00, 0x03, 0x00, 0xaa, 0xbb, 0xcc]
        );
        assert_eq!(encode_stream_write(3, 0x24, &[]).unwrap().len(), STREAM_HEADER_LEN);
        assert_eq!(encode_flush(9), [9, 0xff]);
    }

    #[test]
    fn address_out_of_range() {
        for address in [0xffff, 0x1_0000, u32::MAX] {
            assert!(matches!(encode_read(0, address), Err(Error::InvalidParameter(_))));
            assert!(matches!(encode_write(0, address, 1), Err(Error::InvalidParameter(_))));
            assert!(matches!(
                encode_stream_read(0, address, 1),
                Err(Error::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn stream_len_out_of_range() {
        let data = vec![0; MAX_STREAM_LEN + 1];
        assert!(matches!(
            encode_stream_write(0, 0, &data),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            encode_stream_read(0, 0, MAX_STREAM_LEN + 1),
            Err(Error::InvalidParameter(_))
        ));
        assert!(encode_stream_write(0, 0, &data[..MAX_STREAM_LEN]).is_ok());
    }

    #[test]
    fn failed_append_leaves_buffer_alone() {
        let mut buf = vec![1, 2, 3];
        assert!(write_write_into(&mut buf, 0, 0xffff, 0).is_err());
        assert!(write_stream_write_into(&mut buf, 0, 0x10, &vec![0; 0x1_0000]).is_err());
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn decode_lengths() {
        assert_eq!(decode_read_response(&[1, 0, 0, 0x80]).unwrap(), 0x8000_0001);
        assert!(matches!(decode_read_response(&[1, 2, 3]), Err(Error::Protocol(_))));
        assert!(matches!(decode_read_response(&[1, 2, 3, 4, 5]), Err(Error::Protocol(_))));

        assert!(decode_write_ack(&[0, 0]).is_ok());
        assert!(matches!(decode_write_ack(&[0]), Err(Error::Protocol(_))));
        assert!(matches!(decode_write_ack(&[]), Err(Error::Protocol(_))));

        assert_eq!(decode_stream_read_response(&[9, 4, 1, 2], 2).unwrap(), [1, 2]);
        assert!(decode_stream_read_response(&[9, 4, 1], 2).is_err());
        assert!(decode_stream_read_response(&[9], 0).is_err());
    }

    #[test]
    fn parse_batch() {
        let mut buf = Vec::new();
        write_write_into(&mut buf, 1, 0x10, 0xaabb_ccdd).unwrap();
        write_stream_write_into(&mut buf, 2, 0x24, b"hi").unwrap();
        buf.extend_from_slice(&encode_read(3, 0x08).unwrap());
        buf.extend_from_slice(&encode_stream_read(4, 0x3c, 5).unwrap());
        buf.extend_from_slice(&encode_flush(5));

        let mut rest = &buf[..];
        let mut parsed = Vec::new();
        while !rest.is_empty() {
            let (req, r) = Request::parse(rest).unwrap();
            parsed.push(req);
            rest = r;
        }
        assert_eq!(
            parsed,
            [
                Request::Write { seq: 1, address: 0x10, value: 0xaabb_ccdd },
                Request::StreamWrite { seq: 2, address: 0x24, data: b"hi" },
                Request::Read { seq: 3, address: 0x08 },
                Request::StreamRead { seq: 4, address: 0x3c, len: 5 },
                Request::Flush { seq: 5 },
            ]
        );
        assert_eq!(parsed[1].opcode(), OpCode::StreamWrite);
        assert_eq!(parsed[4].seq(), 5);
    }

    #[test]
    fn parse_garbage() {
        assert!(Request::parse(&[0]).is_err());
        assert!(Request::parse(&[0, 0x42, 0, 0]).is_err());
        assert!(Request::parse(&[0, 0x01, 0, 0, 1, 2]).is_err());
        assert!(Request::parse(&[0, 0x03, 0, 0, 4, 0, 1]).is_err());
    }
}
