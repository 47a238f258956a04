//! A plain TCP implementation of the session seam.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    error::Result,
    op::TypedOp,
    options::ServerAddress,
    session::{Connect, ReplyMessage, Session},
    wire::MessageHeader,
};

/// Dials unencrypted TCP connections to the replay target.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Session = TcpSession;

    async fn connect(&self, target: &ServerAddress) -> Result<TcpSession> {
        let stream = TcpStream::connect((target.host(), target.port()))
            .await
            .map_err(|e| crate::error::Error::dial(format!("{}: {}", target, e)))?;
        stream.set_nodelay(true)?;

        Ok(TcpSession { stream })
    }
}

/// One TCP connection to the target server.
///
/// No socket timeout is applied: captures legitimately contain pauses
/// longer than any reasonable deadline, and imposing one would fail ops
/// that the original deployment completed.
#[derive(Debug)]
pub struct TcpSession {
    stream: TcpStream,
}

impl TcpSession {
    async fn read_reply(&mut self) -> Result<ReplyMessage> {
        let header = MessageHeader::read_from(&mut self.stream).await?;

        let body_len = usize::try_from(header.length)
            .ok()
            .and_then(|len| len.checked_sub(MessageHeader::LENGTH))
            .ok_or_else(|| {
                crate::error::Error::malformed_message(format!(
                    "live reply header declares an impossible length of {}",
                    header.length
                ))
            })?;
        let mut body = vec![0_u8; body_len];
        self.stream.read_exact(&mut body).await?;

        let op = TypedOp::classify(&header, &body)?;
        Ok(ReplyMessage { header, op })
    }
}

impl Session for TcpSession {
    async fn execute(
        &mut self,
        op: &TypedOp,
        header: &MessageHeader,
    ) -> Result<Option<ReplyMessage>> {
        let frame = op.encode(header.request_id, header.response_to)?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        if !op.expects_reply() {
            return Ok(None);
        }

        let reply = self.read_reply().await?;
        if reply.header.response_to != header.request_id {
            tracing::debug!(
                expected = header.request_id,
                got = reply.header.response_to,
                "live reply answered a different request id"
            );
        }
        Ok(Some(reply))
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    use super::{TcpConnector, TcpSession};
    use crate::{
        op::TypedOp,
        options::ServerAddress,
        session::{Connect, Session},
        wire::{legacy, MessageHeader, OpCode},
    };

    fn local_address(port: u16) -> ServerAddress {
        ServerAddress {
            host: "127.0.0.1".to_string(),
            port: Some(port),
        }
    }

    #[tokio::test]
    async fn dial_failure_is_a_dial_error() {
        // Grab a free port, then close the listener so nothing answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpConnector
            .connect(&local_address(port))
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::Dial { .. }
        ));
    }

    #[tokio::test]
    async fn fire_and_forget_ops_write_without_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut frame = Vec::new();
            socket.read_to_end(&mut frame).await.unwrap();
            frame
        });

        let mut session: TcpSession = TcpConnector.connect(&local_address(port)).await.unwrap();

        let op = TypedOp::Insert(legacy::Insert {
            flags: 0,
            collection: "test.events".to_string(),
            documents: vec![doc! { "_id": 1 }],
        });
        let header = MessageHeader {
            length: 0,
            request_id: 5,
            response_to: 0,
            op_code: OpCode::Insert as i32,
        };

        let reply = session.execute(&op, &header).await.unwrap();
        assert!(reply.is_none());
        session.close().await;

        let frame = server.await.unwrap();
        let sent = MessageHeader::from_slice(&frame).unwrap();
        assert_eq!(sent.request_id, 5);
        assert_eq!(sent.op_code(), Some(OpCode::Insert));
        assert_eq!(sent.length as usize, frame.len());
    }
}
