//! Bodies for the pre-OP_MSG wire protocol operations.
//!
//! Captures routinely mix protocol generations, so the replay path has to
//! speak every opcode a 3.x-era driver could emit, not just OP_MSG.

use bitflags::bitflags;
use bson::Document;

use super::util::{write_cstring, write_document, BodyReader};
use crate::error::Result;

bitflags! {
    /// Represents the bitwise flags for an OP_QUERY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        const TAILABLE_CURSOR   = 0b_0000_0010;
        const SLAVE_OK          = 0b_0000_0100;
        const OPLOG_REPLAY      = 0b_0000_1000;
        const NO_CURSOR_TIMEOUT = 0b_0001_0000;
        const AWAIT_DATA        = 0b_0010_0000;
        const EXHAUST           = 0b_0100_0000;
        const PARTIAL           = 0b_1000_0000;
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_REPLY.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND = 0b_0001;
        const QUERY_FAILURE    = 0b_0010;
        const SHARD_CONFIG_STALE = 0b_0100;
        const AWAIT_CAPABLE    = 0b_1000;
    }
}

/// Represents a wire protocol OP_QUERY operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub flags: QueryFlags,
    /// The full collection namespace, e.g. `db.collection` or `db.$cmd`.
    pub collection: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields: Option<Document>,
}

impl Query {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let flags = QueryFlags::from_bits_truncate(reader.read_u32()?);
        let collection = reader.read_cstring()?;
        let number_to_skip = reader.read_i32()?;
        let number_to_return = reader.read_i32()?;
        let query = reader.read_document()?;
        let return_fields = if reader.is_empty() {
            None
        } else {
            Some(reader.read_document()?)
        };

        Ok(Self {
            flags,
            collection,
            number_to_skip,
            number_to_return,
            query,
            return_fields,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(&mut buf, &self.collection);
        buf.extend_from_slice(&self.number_to_skip.to_le_bytes());
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        write_document(&mut buf, &self.query)?;
        if let Some(ref fields) = self.return_fields {
            write_document(&mut buf, fields)?;
        }
        Ok(buf)
    }
}

/// Represents a wire protocol OP_GET_MORE operation.
#[derive(Clone, Debug, PartialEq)]
pub struct GetMore {
    pub collection: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl GetMore {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        reader.read_i32()?; // reserved
        let collection = reader.read_cstring()?;
        let number_to_return = reader.read_i32()?;
        let cursor_id = reader.read_i64()?;

        Ok(Self {
            collection,
            number_to_return,
            cursor_id,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0_i32.to_le_bytes());
        write_cstring(&mut buf, &self.collection);
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        Ok(buf)
    }
}

/// Represents a wire protocol OP_INSERT operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub flags: u32,
    pub collection: String,
    pub documents: Vec<Document>,
}

impl Insert {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let flags = reader.read_u32()?;
        let collection = reader.read_cstring()?;
        let mut documents = Vec::new();
        while !reader.is_empty() {
            documents.push(reader.read_document()?);
        }

        Ok(Self {
            flags,
            collection,
            documents,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.flags.to_le_bytes());
        write_cstring(&mut buf, &self.collection);
        for doc in &self.documents {
            write_document(&mut buf, doc)?;
        }
        Ok(buf)
    }
}

/// Represents a wire protocol OP_UPDATE operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub collection: String,
    pub flags: u32,
    pub selector: Document,
    pub update: Document,
}

impl Update {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        reader.read_i32()?; // reserved
        let collection = reader.read_cstring()?;
        let flags = reader.read_u32()?;
        let selector = reader.read_document()?;
        let update = reader.read_document()?;

        Ok(Self {
            collection,
            flags,
            selector,
            update,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0_i32.to_le_bytes());
        write_cstring(&mut buf, &self.collection);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        write_document(&mut buf, &self.selector)?;
        write_document(&mut buf, &self.update)?;
        Ok(buf)
    }
}

/// Represents a wire protocol OP_DELETE operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub collection: String,
    pub flags: u32,
    pub selector: Document,
}

impl Delete {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        reader.read_i32()?; // reserved
        let collection = reader.read_cstring()?;
        let flags = reader.read_u32()?;
        let selector = reader.read_document()?;

        Ok(Self {
            collection,
            flags,
            selector,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0_i32.to_le_bytes());
        write_cstring(&mut buf, &self.collection);
        buf.extend_from_slice(&self.flags.to_le_bytes());
        write_document(&mut buf, &self.selector)?;
        Ok(buf)
    }
}

/// Represents a wire protocol OP_KILL_CURSORS operation.
#[derive(Clone, Debug, PartialEq)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

impl KillCursors {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        reader.read_i32()?; // reserved
        let count = reader.read_i32()?;
        let mut cursor_ids = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            cursor_ids.push(reader.read_i64()?);
        }

        Ok(Self { cursor_ids })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0_i32.to_le_bytes());
        buf.extend_from_slice(&(self.cursor_ids.len() as i32).to_le_bytes());
        for id in &self.cursor_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        Ok(buf)
    }
}

/// Represents a wire protocol OP_REPLY operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub response_flags: ResponseFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let response_flags = ResponseFlags::from_bits_truncate(reader.read_u32()?);
        let cursor_id = reader.read_i64()?;
        let starting_from = reader.read_i32()?;
        let number_returned = reader.read_i32()?;

        let mut documents = Vec::new();
        while !reader.is_empty() {
            documents.push(reader.read_document()?);
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.response_flags.bits().to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        buf.extend_from_slice(&self.starting_from.to_le_bytes());
        buf.extend_from_slice(&self.number_returned.to_le_bytes());
        for doc in &self.documents {
            write_document(&mut buf, doc)?;
        }
        Ok(buf)
    }
}

/// Represents an OP_COMMAND operation, the intra-cluster command protocol
/// used by 3.2-era deployments.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub database: String,
    pub command_name: String,
    pub metadata: Document,
    pub command_args: Document,
    pub input_docs: Vec<Document>,
}

impl Command {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let database = reader.read_cstring()?;
        let command_name = reader.read_cstring()?;
        let metadata = reader.read_document()?;
        let command_args = reader.read_document()?;
        let mut input_docs = Vec::new();
        while !reader.is_empty() {
            input_docs.push(reader.read_document()?);
        }

        Ok(Self {
            database,
            command_name,
            metadata,
            command_args,
            input_docs,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_cstring(&mut buf, &self.database);
        write_cstring(&mut buf, &self.command_name);
        write_document(&mut buf, &self.metadata)?;
        write_document(&mut buf, &self.command_args)?;
        for doc in &self.input_docs {
            write_document(&mut buf, doc)?;
        }
        Ok(buf)
    }
}

/// Represents an OP_COMMANDREPLY operation.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandReply {
    pub metadata: Document,
    pub command_reply: Document,
    pub output_docs: Vec<Document>,
}

impl CommandReply {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let metadata = reader.read_document()?;
        let command_reply = reader.read_document()?;
        let mut output_docs = Vec::new();
        while !reader.is_empty() {
            output_docs.push(reader.read_document()?);
        }

        Ok(Self {
            metadata,
            command_reply,
            output_docs,
        })
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_document(&mut buf, &self.metadata)?;
        write_document(&mut buf, &self.command_reply)?;
        for doc in &self.output_docs {
            write_document(&mut buf, doc)?;
        }
        Ok(buf)
    }
}
