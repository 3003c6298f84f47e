//! Reassembly of raw TCP byte sequences into complete chunks. The
//! connection manager delivers partial reads as they arrive; this buffer
//! accumulates them, validates each chunk header as soon as its eight bytes
//! are present and emits every completed chunk.

use crate::frame::{self, TcpMessageHeader};
use bytes::BytesMut;
use uabase::status::StatusCode;

pub struct ChunkBuffer {
    buffer: BytesMut,
    current_chunk_size: usize,
    recv_buffer_size: usize,
}

impl ChunkBuffer {
    pub fn new(recv_buffer_size: usize) -> ChunkBuffer {
        ChunkBuffer {
            buffer: BytesMut::with_capacity(recv_buffer_size.min(1 << 16)),
            current_chunk_size: 0,
            recv_buffer_size,
        }
    }

    /// Applies the negotiated receive buffer size; later chunks must fit it.
    pub fn set_limit(&mut self, recv_buffer_size: usize) {
        self.recv_buffer_size = recv_buffer_size;
    }

    /// Bytes buffered for the chunk currently being assembled.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes an incoming byte sequence and returns all chunks it
    /// completed. A header failing validation aborts the whole stream.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<Vec<BytesMut>, StatusCode> {
        let mut complete = Vec::new();
        while !data.is_empty() {
            // assemble the fixed header first, it carries the chunk length
            if self.buffer.len() < frame::MESSAGE_HEADER_LENGTH {
                let missing = frame::MESSAGE_HEADER_LENGTH - self.buffer.len();
                let take = missing.min(data.len());
                self.buffer.extend_from_slice(&data[..take]);
                data = &data[take..];
                if self.buffer.len() < frame::MESSAGE_HEADER_LENGTH {
                    break;
                }
            }

            if self.current_chunk_size == 0 {
                self.current_chunk_size = self.parse_chunk_size()?;
            }

            let missing = self.current_chunk_size - self.buffer.len();
            let take = missing.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.current_chunk_size {
                complete.push(self.buffer.split_to(self.current_chunk_size));
                self.current_chunk_size = 0;
            }
        }
        Ok(complete)
    }

    /// Drops any partially assembled chunk.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.current_chunk_size = 0;
    }

    fn parse_chunk_size(&self) -> Result<usize, StatusCode> {
        let mut stream = &self.buffer[..frame::MESSAGE_HEADER_LENGTH];
        let header = TcpMessageHeader::decode(&mut stream)?;

        let size = header.message_size as usize;
        if size < frame::MIN_CHUNK_SIZE || size > self.recv_buffer_size {
            return Err(StatusCode::BAD_COMMUNICATION_ERROR);
        }
        Ok(size)
    }
}
