use crate::ids::{EdgeId, TaskId};
use crate::prelude::*;

/// Size in bytes of the fixed header at the start of every message: source, edge, flags,
/// payload length and the destination stamp, each a big-endian `i32`. This is one field more
/// than the classic 16-byte layout of source, edge, flags and length; peers using that layout
/// cannot read these messages.
pub const HEADER_SIZE: usize = 5 * 4;

/// Destination stamp of messages that fan out to every local destination of the receiver.
const NO_DESTINATION: i32 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("{0} bytes are not enough to hold a message header")]
    Truncated(usize),

    #[error("negative payload length {0} in message header")]
    NegativeLength(i32),

    #[error("payload of {0} bytes does not fit in a message header")]
    LengthOverflow(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub source: TaskId,
    pub edge: EdgeId,
    pub flags: i32,
    /// Number of payload bytes following the header, summed over all buffers of the message.
    pub length: usize,
    pub destination: Option<TaskId>,
}

impl MessageHeader {
    pub fn new(
        source: TaskId,
        edge: EdgeId,
        flags: i32,
        length: usize,
        destination: Option<TaskId>,
    ) -> Self {
        Self {
            source,
            edge,
            flags,
            length,
            destination,
        }
    }

    pub fn encode(&self, out: &mut [u8]) -> Result<(), HeaderError> {
        if out.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated(out.len()));
        }

        let length =
            i32::try_from(self.length).map_err(|_| HeaderError::LengthOverflow(self.length))?;
        let destination = self.destination.map_or(NO_DESTINATION, TaskId::get);
        let words = [
            self.source.get(),
            self.edge.get(),
            self.flags,
            length,
            destination,
        ];

        for (chunk, word) in zip(out.chunks_exact_mut(4), &words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated(bytes.len()));
        }

        let word = |i: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..(i + 1) * 4]);
            i32::from_be_bytes(raw)
        };

        let length = word(3);
        if length < 0 {
            return Err(HeaderError::NegativeLength(length));
        }

        let destination = match word(4) {
            NO_DESTINATION => None,
            d => Some(TaskId(d)),
        };

        Ok(Self {
            source: TaskId(word(0)),
            edge: EdgeId(word(1)),
            flags: word(2),
            length: length as usize,
            destination,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new(TaskId(7), EdgeId(3), 0b101, 1000, Some(TaskId(12)));
        let mut buffer = [0u8; HEADER_SIZE + 4];
        header.encode(&mut buffer).unwrap();

        // Fields are big-endian words in a fixed order.
        assert_eq!(&buffer[0..4], &[0, 0, 0, 7]);
        assert_eq!(&buffer[4..8], &[0, 0, 0, 3]);
        assert_eq!(&buffer[8..12], &[0, 0, 0, 5]);
        assert_eq!(&buffer[12..16], &1000i32.to_be_bytes());
        assert_eq!(&buffer[16..20], &[0, 0, 0, 12]);

        assert_eq!(MessageHeader::decode(&buffer).unwrap(), header);
    }

    #[test]
    fn test_header_without_destination() {
        let header = MessageHeader::new(TaskId(0), EdgeId(1), 0, 0, None);
        let mut buffer = [0u8; HEADER_SIZE];
        header.encode(&mut buffer).unwrap();
        assert_eq!(&buffer[16..20], &(-1i32).to_be_bytes());
        assert_eq!(MessageHeader::decode(&buffer).unwrap().destination, None);
    }

    #[test]
    fn test_header_errors() {
        let header = MessageHeader::new(TaskId(0), EdgeId(1), 0, 0, None);
        assert_eq!(
            header.encode(&mut [0u8; 8]),
            Err(HeaderError::Truncated(8))
        );
        assert_eq!(
            MessageHeader::decode(&[0u8; 19]),
            Err(HeaderError::Truncated(19))
        );

        let mut buffer = [0u8; HEADER_SIZE];
        buffer[12..16].copy_from_slice(&(-5i32).to_be_bytes());
        assert_eq!(
            MessageHeader::decode(&buffer),
            Err(HeaderError::NegativeLength(-5))
        );
    }
}
