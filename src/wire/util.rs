use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{ErrorKind, Result};

/// A cursor over a captured message body that tracks how many bytes remain.
///
/// Captured bodies arrive as complete buffers, so parsing is plain slice
/// walking rather than async reads.
pub(crate) struct BodyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn bytes_remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytes_remaining() == 0
    }

    fn advance(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes_remaining() < n {
            return Err(ErrorKind::MalformedMessage {
                message: format!(
                    "message body requires {} more bytes but only has {}",
                    n,
                    self.bytes_remaining()
                ),
            }
            .into());
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.advance(1)?[0])
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        let mut slice = self.advance(4)?;
        Ok(slice.read_i32::<LittleEndian>()?)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let mut slice = self.advance(4)?;
        Ok(slice.read_u32::<LittleEndian>()?)
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        let mut slice = self.advance(8)?;
        Ok(slice.read_i64::<LittleEndian>()?)
    }

    /// Reads a null-terminated cstring, not including the terminator.
    pub(crate) fn read_cstring(&mut self) -> Result<String> {
        let remaining = &self.bytes[self.pos..];
        let end = remaining
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| crate::error::Error::malformed_message("unterminated cstring"))?;
        let s = std::str::from_utf8(&remaining[..end])
            .map_err(|e| crate::error::Error::malformed_message(e.to_string()))?
            .to_string();
        self.pos += end + 1;
        Ok(s)
    }

    /// Reads one length-prefixed BSON document as its raw bytes, length
    /// prefix included.
    pub(crate) fn read_document_bytes(&mut self) -> Result<&'a [u8]> {
        let remaining = &self.bytes[self.pos..];
        if remaining.len() < 4 {
            return Err(crate::error::Error::malformed_message(
                "document length prefix truncated",
            ));
        }
        let len = i32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]]);
        if len < 5 || len as usize > remaining.len() {
            return Err(crate::error::Error::malformed_message(format!(
                "document length {} exceeds remaining body of {} bytes",
                len,
                remaining.len()
            )));
        }
        self.advance(len as usize)
    }

    pub(crate) fn read_document(&mut self) -> Result<bson::Document> {
        let bytes = self.read_document_bytes()?;
        Ok(bson::Document::from_reader(&mut std::io::Cursor::new(
            bytes,
        ))?)
    }
}

pub(crate) fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub(crate) fn write_document(buf: &mut Vec<u8>, doc: &bson::Document) -> Result<()> {
    doc.to_writer(buf)?;
    Ok(())
}
