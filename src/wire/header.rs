use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ErrorKind, Result};

/// The wire protocol op codes, as they appear on the wire.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Command = 2010,
    CommandReply = 2011,
    Message = 2013,
}

impl OpCode {
    /// Attempt to infer the op code based on the numeric value.
    pub fn from_i32(i: i32) -> Option<Self> {
        match i {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            2010 => Some(OpCode::Command),
            2011 => Some(OpCode::CommandReply),
            2013 => Some(OpCode::Message),
            _ => None,
        }
    }
}

/// The header prefixed to every wire protocol message.
///
/// The op code is kept as the raw integer so that messages with codes this
/// crate doesn't know about can still be carried through and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub const LENGTH: usize = 4 * std::mem::size_of::<i32>();

    /// The typed op code, if the raw value is one this crate understands.
    pub fn op_code(&self) -> Option<OpCode> {
        OpCode::from_i32(self.op_code)
    }

    /// Parses a header from the front of a captured byte buffer.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH {
            return Err(ErrorKind::MalformedMessage {
                message: format!(
                    "header requires {} bytes but only got {}",
                    Self::LENGTH,
                    data.len()
                ),
            }
            .into());
        }
        let mut cursor = Cursor::new(data);

        let length = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?;
        let request_id = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?;
        let response_to = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?;
        let op_code = ReadBytesExt::read_i32::<LittleEndian>(&mut cursor)?;

        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = reader.read_i32_le().await?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    pub(crate) fn write_to_vec(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.to_le_bytes());
    }
}
