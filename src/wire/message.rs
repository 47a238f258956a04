use bitflags::bitflags;
use bson::Document;

use super::util::{write_cstring, write_document, BodyReader};
use crate::error::{ErrorKind, Result};

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// The body of an OP_MSG wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub flags: MessageFlags,
    pub sections: Vec<MessageSection>,
    pub checksum: Option<u32>,
}

impl Message {
    /// Deserializes a Message from a captured body (header already
    /// stripped).
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let flags = MessageFlags::from_bits_truncate(reader.read_u32()?);

        let mut sections = Vec::new();
        while reader.bytes_remaining() > 4 {
            sections.push(MessageSection::read(&mut reader)?);
        }

        let mut checksum = None;
        if reader.bytes_remaining() == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum = Some(reader.read_u32()?);
        } else if !reader.is_empty() {
            return Err(ErrorKind::MalformedMessage {
                message: format!(
                    "OP_MSG body has {} trailing bytes after its sections",
                    reader.bytes_remaining()
                ),
            }
            .into());
        }

        Ok(Self {
            flags,
            sections,
            checksum,
        })
    }

    /// Serializes the Message back into body bytes.
    ///
    /// Any recorded checksum is dropped rather than recomputed; the flag bit
    /// is cleared to match.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let flags = self.flags & !MessageFlags::CHECKSUM_PRESENT;
        buf.extend_from_slice(&flags.bits().to_le_bytes());

        for section in &self.sections {
            section.write(&mut buf)?;
        }

        Ok(buf)
    }

    /// Gets the command document, i.e. the first payload-type-0 section.
    pub fn command_document(&self) -> Option<&Document> {
        self.sections.iter().find_map(|section| match section {
            MessageSection::Document(doc) => Some(doc),
            MessageSection::Sequence { .. } => None,
        })
    }

    pub(crate) fn command_document_mut(&mut self) -> Option<&mut Document> {
        self.sections.iter_mut().find_map(|section| match section {
            MessageSection::Document(doc) => Some(doc),
            MessageSection::Sequence { .. } => None,
        })
    }

    /// The name of the command this message carries, i.e. the first key of
    /// its command document.
    pub fn command_name(&self) -> Option<&str> {
        self.command_document()
            .and_then(|doc| doc.keys().next().map(|k| k.as_str()))
    }

    /// Whether the sender expects no reply to this message.
    pub fn expects_reply(&self) -> bool {
        !self.flags.contains(MessageFlags::MORE_TO_COME)
    }
}

/// Represents a section as defined by the OP_MSG spec.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl MessageSection {
    fn read(reader: &mut BodyReader<'_>) -> Result<Self> {
        let payload_type = reader.read_u8()?;

        if payload_type == 0 {
            return Ok(MessageSection::Document(reader.read_document()?));
        }

        let size = reader.read_i32()?;
        let section_end = match (reader.bytes_remaining() + 4).checked_sub(size as usize) {
            Some(remaining) if size >= 4 => remaining,
            _ => {
                return Err(ErrorKind::MalformedMessage {
                    message: format!("document sequence length {} overruns its message", size),
                }
                .into())
            }
        };

        let identifier = reader.read_cstring()?;
        let mut documents = Vec::new();
        while reader.bytes_remaining() > section_end {
            documents.push(reader.read_document()?);
        }

        if reader.bytes_remaining() != section_end {
            return Err(ErrorKind::MalformedMessage {
                message: "document sequence length disagrees with its contents".to_string(),
            }
            .into());
        }

        Ok(MessageSection::Sequence {
            identifier,
            documents,
        })
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(doc) => {
                buf.push(0);
                write_document(buf, doc)?;
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                buf.push(1);

                let mut body = Vec::new();
                write_cstring(&mut body, identifier);
                for doc in documents {
                    write_document(&mut body, doc)?;
                }

                let size = body.len() as i32 + 4;
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&body);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::{Message, MessageFlags, MessageSection};

    #[test]
    fn body_round_trip() {
        let message = Message {
            flags: MessageFlags::empty(),
            sections: vec![
                MessageSection::Document(doc! { "insert": "events", "$db": "test" }),
                MessageSection::Sequence {
                    identifier: "documents".to_string(),
                    documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
                },
            ],
            checksum: None,
        };

        let body = message.to_body().unwrap();
        let parsed = Message::from_body(&body).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.command_name(), Some("insert"));
    }

    #[test]
    fn checksum_is_consumed_and_dropped() {
        let mut body = Vec::new();
        body.extend_from_slice(&MessageFlags::CHECKSUM_PRESENT.bits().to_le_bytes());
        body.push(0);
        doc! { "ping": 1 }.to_writer(&mut body).unwrap();
        body.extend_from_slice(&0xdead_beef_u32.to_le_bytes());

        let parsed = Message::from_body(&body).unwrap();
        assert_eq!(parsed.checksum, Some(0xdead_beef));
        assert!(!parsed
            .to_body()
            .unwrap()
            .starts_with(&MessageFlags::CHECKSUM_PRESENT.bits().to_le_bytes()));
    }

    #[test]
    fn more_to_come_suppresses_reply() {
        let message = Message {
            flags: MessageFlags::MORE_TO_COME,
            sections: vec![MessageSection::Document(doc! { "insert": "events" })],
            checksum: None,
        };
        assert!(!message.expects_reply());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&MessageFlags::empty().bits().to_le_bytes());
        body.push(0);
        doc! { "ping": 1 }.to_writer(&mut body).unwrap();
        body.extend_from_slice(&[1, 2]);

        assert!(Message::from_body(&body).is_err());
    }
}
