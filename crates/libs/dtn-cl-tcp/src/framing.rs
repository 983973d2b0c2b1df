//! Message framing for the connection-oriented CL (§4.5): a one-byte type
//! tag followed by a type-specific body.

use dtn_core::error::ParseError;
use dtn_core::sdnv;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    StartBundle,
    DataBlock,
    AckBlock,
    Keepalive,
    Shutdown,
}

impl MessageType {
    fn wire(self) -> u8 {
        match self {
            MessageType::StartBundle => 1,
            MessageType::DataBlock => 2,
            MessageType::AckBlock => 3,
            MessageType::Keepalive => 4,
            MessageType::Shutdown => 5,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, ParseError> {
        Ok(match byte {
            1 => MessageType::StartBundle,
            2 => MessageType::DataBlock,
            3 => MessageType::AckBlock,
            4 => MessageType::Keepalive,
            5 => MessageType::Shutdown,
            _ => return Err(ParseError::BadFlags),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    /// Declares the total length of the bundle about to be streamed via
    /// subsequent `DataBlock` frames.
    StartBundle { total_length: u64 },
    DataBlock { data: Vec<u8> },
    AckBlock { cumulative_offset: u64 },
    Keepalive,
    Shutdown,
}

impl Frame {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::StartBundle { total_length } => {
                out.push(MessageType::StartBundle.wire());
                sdnv::encode(*total_length, out);
            }
            Frame::DataBlock { data } => {
                out.push(MessageType::DataBlock.wire());
                sdnv::encode(data.len() as u64, out);
                out.extend_from_slice(data);
            }
            Frame::AckBlock { cumulative_offset } => {
                out.push(MessageType::AckBlock.wire());
                sdnv::encode(*cumulative_offset, out);
            }
            Frame::Keepalive => out.push(MessageType::Keepalive.wire()),
            Frame::Shutdown => out.push(MessageType::Shutdown.wire()),
        }
    }

    /// Attempts to decode one frame from the front of `bytes`. Returns
    /// `Ok(None)` if the buffer does not yet hold a complete frame (the
    /// caller should read more before retrying), matching the streaming
    /// decoder contract used for bundle parsing in §4.1.
    pub fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>, ParseError> {
        let Some(&tag) = bytes.first() else { return Ok(None) };
        let msg_type = MessageType::from_wire(tag)?;
        let body = &bytes[1..];
        match msg_type {
            MessageType::StartBundle => match sdnv::decode(body) {
                Ok((total_length, n)) => Ok(Some((Frame::StartBundle { total_length }, 1 + n))),
                Err(_) => Ok(None),
            },
            MessageType::DataBlock => {
                let (len, n) = match sdnv::decode(body) {
                    Ok(v) => v,
                    Err(_) => return Ok(None),
                };
                let len = len as usize;
                if body.len() < n + len {
                    return Ok(None);
                }
                let data = body[n..n + len].to_vec();
                Ok(Some((Frame::DataBlock { data }, 1 + n + len)))
            }
            MessageType::AckBlock => match sdnv::decode(body) {
                Ok((cumulative_offset, n)) => {
                    Ok(Some((Frame::AckBlock { cumulative_offset }, 1 + n)))
                }
                Err(_) => Ok(None),
            },
            MessageType::Keepalive => Ok(Some((Frame::Keepalive, 1))),
            MessageType::Shutdown => Ok(Some((Frame::Shutdown, 1))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let (decoded, consumed) = Frame::decode(&buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn every_variant_round_trips() {
        round_trip(Frame::StartBundle { total_length: 12345 });
        round_trip(Frame::DataBlock { data: vec![1, 2, 3, 4] });
        round_trip(Frame::DataBlock { data: Vec::new() });
        round_trip(Frame::AckBlock { cumulative_offset: 999 });
        round_trip(Frame::Keepalive);
        round_trip(Frame::Shutdown);
    }

    #[test]
    fn decode_reports_incomplete_data_block_as_none() {
        let mut buf = Vec::new();
        Frame::DataBlock { data: vec![1, 2, 3, 4, 5] }.encode(&mut buf);
        let short = &buf[..buf.len() - 2];
        assert_eq!(Frame::decode(short).unwrap(), None);
    }

    #[test]
    fn decode_empty_buffer_is_none() {
        assert_eq!(Frame::decode(&[]).unwrap(), None);
    }

    #[test]
    fn decode_unknown_tag_is_error() {
        assert_eq!(Frame::decode(&[0xEE]), Err(ParseError::BadFlags));
    }
}
