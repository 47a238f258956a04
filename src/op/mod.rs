//! Typed views of recorded wire protocol operations.


use std::{
    fmt::{self, Display, Formatter},
    time::SystemTime,
};

use bson::{Bson, Document};
use tokio::time::Instant;

use crate::{
    error::{Error, Result},
    wire::{legacy, Message, MessageHeader, OpCode},
};

/// Commands issued by driver internals rather than the application. The
/// live driver performs its own handshake, so replaying these would at best
/// duplicate work and at worst break authentication on the target.
const DRIVER_COMMAND_NAMES: &[&str] = &[
    "isMaster",
    "ismaster",
    "hello",
    "getnonce",
    "saslStart",
    "saslContinue",
    "authenticate",
    "logout",
];

/// One protocol message observed during capture, together with its timing
/// and connection provenance.
#[derive(Clone, Debug)]
pub struct RecordedOp {
    /// When the original message crossed the wire.
    pub seen_at: SystemTime,

    /// When the replay engine should execute this op. Assigned by the
    /// dispatcher from the global time base; `None` until then.
    pub play_at: Option<Instant>,

    /// Address of the original sender.
    pub src_endpoint: String,

    /// Address of the original receiver.
    pub dst_endpoint: String,

    /// Disambiguates successive connections that reused this endpoint pair.
    /// Assigned by the dispatcher.
    pub generation: u32,

    /// Stable identifier of the logical original connection. Assigned by
    /// the dispatcher.
    pub connection_num: u64,

    /// The message header as captured.
    pub header: MessageHeader,

    /// The message body (header excluded), parsed lazily.
    pub body: Vec<u8>,
}

impl RecordedOp {
    /// Creates an op as the op source yields it, before the dispatcher has
    /// assigned scheduling and connection identity.
    pub fn new(
        seen_at: SystemTime,
        src_endpoint: impl Into<String>,
        dst_endpoint: impl Into<String>,
        header: MessageHeader,
        body: Vec<u8>,
    ) -> Self {
        Self {
            seen_at,
            play_at: None,
            src_endpoint: src_endpoint.into(),
            dst_endpoint: dst_endpoint.into(),
            generation: 0,
            connection_num: 0,
            header,
            body,
        }
    }

    /// Whether this op is a server-to-client response rather than a request.
    ///
    /// OP_MSG is used in both directions; a message that answers another
    /// carries its `request_id` in `response_to`, and requests always carry
    /// zero there.
    pub fn is_reply_flavored(&self) -> bool {
        match self.header.op_code() {
            Some(OpCode::Reply) | Some(OpCode::CommandReply) => true,
            Some(OpCode::Message) => self.header.response_to != 0,
            _ => false,
        }
    }

    /// Parses the body into a typed operation.
    pub fn classify(&self) -> Result<TypedOp> {
        TypedOp::classify(&self.header, &self.body)
    }

    /// The total captured frame size, header included.
    pub fn frame_bytes(&self) -> u64 {
        (MessageHeader::LENGTH + self.body.len()) as u64
    }
}

/// A classified wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedOp {
    Query(legacy::Query),
    GetMore(legacy::GetMore),
    Insert(legacy::Insert),
    Update(legacy::Update),
    Delete(legacy::Delete),
    KillCursors(legacy::KillCursors),
    Reply(legacy::Reply),
    Command(legacy::Command),
    CommandReply(legacy::CommandReply),
    Msg(Message),
    /// An opcode this crate doesn't speak; skipped, never executed.
    Unknown,
}

impl TypedOp {
    /// Parses `(header, body)` into a typed operation, selecting by opcode.
    pub fn classify(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let typed = match header.op_code() {
            Some(OpCode::Reply) => Self::Reply(legacy::Reply::from_body(body)?),
            Some(OpCode::Update) => Self::Update(legacy::Update::from_body(body)?),
            Some(OpCode::Insert) => Self::Insert(legacy::Insert::from_body(body)?),
            Some(OpCode::Query) => Self::Query(legacy::Query::from_body(body)?),
            Some(OpCode::GetMore) => Self::GetMore(legacy::GetMore::from_body(body)?),
            Some(OpCode::Delete) => Self::Delete(legacy::Delete::from_body(body)?),
            Some(OpCode::KillCursors) => Self::KillCursors(legacy::KillCursors::from_body(body)?),
            Some(OpCode::Command) => Self::Command(legacy::Command::from_body(body)?),
            Some(OpCode::CommandReply) => Self::CommandReply(legacy::CommandReply::from_body(body)?),
            Some(OpCode::Message) => Self::Msg(Message::from_body(body)?),
            None => Self::Unknown,
        };
        Ok(typed)
    }

    /// The wire opcode for this operation, if it has one.
    pub fn op_code(&self) -> Option<OpCode> {
        match self {
            Self::Query(_) => Some(OpCode::Query),
            Self::GetMore(_) => Some(OpCode::GetMore),
            Self::Insert(_) => Some(OpCode::Insert),
            Self::Update(_) => Some(OpCode::Update),
            Self::Delete(_) => Some(OpCode::Delete),
            Self::KillCursors(_) => Some(OpCode::KillCursors),
            Self::Reply(_) => Some(OpCode::Reply),
            Self::Command(_) => Some(OpCode::Command),
            Self::CommandReply(_) => Some(OpCode::CommandReply),
            Self::Msg(_) => Some(OpCode::Message),
            Self::Unknown => None,
        }
    }

    /// The command name this op carries, when it is command-shaped.
    ///
    /// For OP_QUERY this only applies to `$cmd` namespaces; a query wrapped
    /// in `$query` is unwrapped first, matching what servers accept.
    pub fn command_name(&self) -> Option<&str> {
        match self {
            Self::Query(query) => {
                if !is_cmd_collection(&query.collection) {
                    return None;
                }
                first_command_key(&query.query)
            }
            Self::Command(command) => Some(command.command_name.as_str()),
            Self::Msg(message) => message.command_name(),
            _ => None,
        }
    }

    /// Whether this op is driver housekeeping (handshakes, auth, topology
    /// heartbeats) that the engine must not replay.
    pub fn is_driver_op(&self) -> bool {
        match self.command_name() {
            Some(name) => DRIVER_COMMAND_NAMES.contains(&name),
            None => false,
        }
    }

    /// Whether executing this op should wait for a server response.
    pub fn expects_reply(&self) -> bool {
        match self {
            Self::Query(_) | Self::GetMore(_) | Self::Command(_) => true,
            Self::Msg(message) => message.expects_reply(),
            Self::Insert(_) | Self::Update(_) | Self::Delete(_) | Self::KillCursors(_) => false,
            Self::Reply(_) | Self::CommandReply(_) | Self::Unknown => false,
        }
    }

    /// The cursor ids this op targets, in wire order. Empty for ops that
    /// don't address cursors.
    pub fn cursor_ids(&self) -> Vec<i64> {
        match self {
            Self::GetMore(get_more) => vec![get_more.cursor_id],
            Self::KillCursors(kill) => kill.cursor_ids.clone(),
            Self::Msg(message) => msg_request_cursor_ids(message),
            _ => Vec::new(),
        }
    }

    /// Replaces this op's cursor ids with `ids`, which must line up with
    /// what [`cursor_ids`](Self::cursor_ids) returned.
    pub fn set_cursor_ids(&mut self, ids: &[i64]) -> Result<()> {
        match self {
            Self::GetMore(get_more) => {
                if ids.len() != 1 {
                    return Err(Error::internal("OP_GET_MORE takes exactly one cursor id"));
                }
                get_more.cursor_id = ids[0];
            }
            Self::KillCursors(kill) => {
                if ids.len() != kill.cursor_ids.len() {
                    return Err(Error::internal("cursor id count changed during rewrite"));
                }
                kill.cursor_ids.clear();
                kill.cursor_ids.extend_from_slice(ids);
            }
            Self::Msg(message) => set_msg_request_cursor_ids(message, ids)?,
            _ => {
                if !ids.is_empty() {
                    return Err(Error::internal("op does not carry cursor ids"));
                }
            }
        }
        Ok(())
    }

    /// Re-encodes this op as a complete wire frame carrying the recorded
    /// request and response ids.
    pub fn encode(&self, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
        let (op_code, body) = match self {
            Self::Query(op) => (OpCode::Query, op.to_body()?),
            Self::GetMore(op) => (OpCode::GetMore, op.to_body()?),
            Self::Insert(op) => (OpCode::Insert, op.to_body()?),
            Self::Update(op) => (OpCode::Update, op.to_body()?),
            Self::Delete(op) => (OpCode::Delete, op.to_body()?),
            Self::KillCursors(op) => (OpCode::KillCursors, op.to_body()?),
            Self::Reply(op) => (OpCode::Reply, op.to_body()?),
            Self::Command(op) => (OpCode::Command, op.to_body()?),
            Self::CommandReply(op) => (OpCode::CommandReply, op.to_body()?),
            Self::Msg(op) => (OpCode::Message, op.to_body()?),
            Self::Unknown => {
                return Err(Error::malformed_message(
                    "an unknown op cannot be re-encoded",
                ))
            }
        };

        let header = MessageHeader {
            length: (MessageHeader::LENGTH + body.len()) as i32,
            request_id,
            response_to,
            op_code: op_code as i32,
        };

        let mut frame = Vec::with_capacity(MessageHeader::LENGTH + body.len());
        header.write_to_vec(&mut frame);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Summarizes this op as a reply for correlation, when it is one.
    ///
    /// Returns `Err` only for a reply whose body should carry a cursor id
    /// but doesn't parse; absence of any cursor (plain command replies) is
    /// the `cursor_id: 0` success case.
    pub fn reply_summary(&self) -> Result<Option<ReplySummary>> {
        match self {
            Self::Reply(reply) => Ok(Some(ReplySummary {
                cursor_id: reply.cursor_id,
                num_returned: reply.number_returned,
            })),
            Self::CommandReply(reply) => {
                let cursor_id = document_cursor_id(&reply.command_reply)?;
                Ok(Some(ReplySummary {
                    cursor_id,
                    num_returned: reply.output_docs.len() as i32,
                }))
            }
            Self::Msg(message) => {
                let doc = match message.command_document() {
                    Some(doc) => doc,
                    None => return Ok(None),
                };
                let cursor_id = document_cursor_id(doc)?;
                let num_returned = doc
                    .get_document("cursor")
                    .ok()
                    .and_then(|cursor| {
                        cursor
                            .get_array("firstBatch")
                            .or_else(|_| cursor.get_array("nextBatch"))
                            .ok()
                    })
                    .map(|batch| batch.len() as i32)
                    .unwrap_or(0);
                Ok(Some(ReplySummary {
                    cursor_id,
                    num_returned,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl Display for TypedOp {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::Query(_) => "query",
            Self::GetMore(_) => "getmore",
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::KillCursors(_) => "killcursors",
            Self::Reply(_) => "reply",
            Self::Command(_) => "command",
            Self::CommandReply(_) => "commandreply",
            Self::Msg(_) => "msg",
            Self::Unknown => "unknown",
        };
        fmt.write_str(name)
    }
}

/// The parts of a reply that cursor correlation needs to retain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplySummary {
    /// The server-assigned cursor id, or 0 when the reply carries none.
    pub cursor_id: i64,

    /// How many documents the reply returned.
    pub num_returned: i32,
}

fn is_cmd_collection(namespace: &str) -> bool {
    namespace == "$cmd" || namespace.ends_with(".$cmd")
}

/// The first key of a command document, looking through a `$query` wrapper
/// when one is present.
fn first_command_key(doc: &Document) -> Option<&str> {
    let first = doc.keys().next()?;
    if first == "$query" {
        if let Ok(inner) = doc.get_document("$query") {
            return inner.keys().next().map(|k| k.as_str());
        }
    }
    Some(first.as_str())
}

/// Extracts the `cursor.id` value from a command-shaped reply document.
///
/// `Ok(0)` when the document has no cursor at all; `Err` when a cursor
/// subdocument exists but its id is missing or mistyped.
fn document_cursor_id(doc: &Document) -> Result<i64> {
    match doc.get("cursor") {
        None => Ok(0),
        Some(Bson::Document(cursor)) => match cursor.get("id") {
            Some(Bson::Int64(id)) => Ok(*id),
            Some(Bson::Int32(id)) => Ok(i64::from(*id)),
            other => Err(Error::malformed_message(format!(
                "reply cursor id missing or mistyped: {:?}",
                other
            ))),
        },
        Some(other) => Err(Error::malformed_message(format!(
            "reply cursor field is not a document: {:?}",
            other
        ))),
    }
}

/// The cursor ids an OP_MSG request addresses: the `getMore` value, or the
/// elements of a `killCursors` op's `cursors` array.
fn msg_request_cursor_ids(message: &Message) -> Vec<i64> {
    let doc = match message.command_document() {
        Some(doc) => doc,
        None => return Vec::new(),
    };
    match doc.keys().next().map(|k| k.as_str()) {
        Some("getMore") => match doc.get("getMore") {
            Some(Bson::Int64(id)) => vec![*id],
            _ => Vec::new(),
        },
        Some("killCursors") => match doc.get_array("cursors") {
            Ok(cursors) => cursors
                .iter()
                .filter_map(|value| match value {
                    Bson::Int64(id) => Some(*id),
                    _ => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn set_msg_request_cursor_ids(message: &mut Message, ids: &[i64]) -> Result<()> {
    let expected = msg_request_cursor_ids(message).len();
    if ids.len() != expected {
        return Err(Error::internal("cursor id count changed during rewrite"));
    }
    if expected == 0 {
        return Ok(());
    }

    let doc = message
        .command_document_mut()
        .ok_or_else(|| Error::internal("cursor-bearing OP_MSG lost its command document"))?;
    match doc.keys().next().map(|k| k.to_string()).as_deref() {
        Some("getMore") => {
            doc.insert("getMore", Bson::Int64(ids[0]));
        }
        Some("killCursors") => {
            let mut replacement = Vec::with_capacity(ids.len());
            let mut remapped = ids.iter();
            if let Ok(cursors) = doc.get_array("cursors") {
                for value in cursors {
                    match value {
                        Bson::Int64(_) => {
                            replacement.push(Bson::Int64(*remapped.next().ok_or_else(|| {
                                Error::internal("cursor id count changed during rewrite")
                            })?))
                        }
                        other => replacement.push(other.clone()),
                    }
                }
            }
            doc.insert("cursors", Bson::Array(replacement));
        }
        _ => return Err(Error::internal("op does not carry cursor ids")),
    }
    Ok(())
}

/// Names a wire opcode for reporting, without requiring it to be one this
/// crate speaks.
pub fn op_code_label(op_code: i32) -> &'static str {
    match OpCode::from_i32(op_code) {
        Some(OpCode::Reply) => "OP_REPLY",
        Some(OpCode::Update) => "OP_UPDATE",
        Some(OpCode::Insert) => "OP_INSERT",
        Some(OpCode::Query) => "OP_QUERY",
        Some(OpCode::GetMore) => "OP_GET_MORE",
        Some(OpCode::Delete) => "OP_DELETE",
        Some(OpCode::KillCursors) => "OP_KILL_CURSORS",
        Some(OpCode::Command) => "OP_COMMAND",
        Some(OpCode::CommandReply) => "OP_COMMANDREPLY",
        Some(OpCode::Message) => "OP_MSG",
        None => "OP_UNKNOWN",
    }
}
