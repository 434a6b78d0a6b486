//! Bounded buffered byte stream for one connection
//!
//! Owns the socket and the per-connection buffers. Input is pulled in
//! chunks no larger than the remaining input-buffer headroom; output is
//! staged in a bounded buffer so every reply produced while handling one
//! input event can be corked into a single write. Both bounds are protocol
//! limits: overflowing either one ends the session.

use crate::config::{MAX_INBUF_SIZE, MAX_OUTBUF_SIZE};
use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer closed the connection.
    #[error("Connection closed")]
    Closed,

    /// Input arrived faster than the session consumed it.
    #[error("Input buffer full")]
    InputBufferFull,

    /// More reply bytes staged than the output bound allows.
    #[error("Transmit buffer full")]
    OutputBufferFull,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Paired bounded reader/writer over a single stream.
#[derive(Debug)]
pub struct Transport<S> {
    stream: S,
    inbuf: BytesMut,
    outbuf: Vec<u8>,
    corked: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            inbuf: BytesMut::with_capacity(MAX_INBUF_SIZE),
            outbuf: Vec::with_capacity(MAX_OUTBUF_SIZE),
            corked: false,
        }
    }

    /// Read whatever the peer has sent, bounded by input-buffer headroom.
    ///
    /// Cancel-safe: a single read call, so this can sit in a `select!`
    /// without losing data.
    pub async fn read_input(&mut self) -> Result<usize, TransportError> {
        let headroom = MAX_INBUF_SIZE - self.inbuf.len();
        if headroom == 0 {
            return Err(TransportError::InputBufferFull);
        }
        let mut chunk = [0u8; MAX_INBUF_SIZE];
        let n = self.stream.read(&mut chunk[..headroom]).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        self.inbuf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Drain and return everything buffered on the input side.
    pub fn take_input(&mut self) -> BytesMut {
        self.inbuf.split()
    }

    /// Stage one reply line, CRLF appended. When uncorked the buffer is
    /// flushed immediately; while corked the line waits for
    /// [`Transport::uncork`].
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        if self.outbuf.len() + line.len() + 2 > MAX_OUTBUF_SIZE {
            return Err(TransportError::OutputBufferFull);
        }
        self.outbuf.extend_from_slice(line.as_bytes());
        self.outbuf.extend_from_slice(b"\r\n");
        if self.corked {
            Ok(())
        } else {
            self.flush().await
        }
    }

    /// Begin batching replies.
    pub fn cork(&mut self) {
        self.corked = true;
    }

    /// Stop batching and flush the batch.
    pub async fn uncork(&mut self) -> Result<(), TransportError> {
        self.corked = false;
        self.flush().await
    }

    /// Write out everything staged and await the drain. The STARTTLS path
    /// relies on this completing before any handshake byte is produced.
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.outbuf.is_empty() {
            self.stream.write_all(&self.outbuf).await?;
            self.outbuf.clear();
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Give up the stream, discarding both buffers. Used when the transport
    /// is replaced mid-connection by its TLS successor.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn corked_replies_arrive_as_one_batch() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut t = Transport::new(server);

        t.cork();
        t.send_line("* CAPABILITY IMAP4rev1").await.unwrap();
        t.send_line("a1 OK Capability completed.").await.unwrap();
        t.uncork().await.unwrap();
        drop(t);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(
            out,
            "* CAPABILITY IMAP4rev1\r\na1 OK Capability completed.\r\n"
        );
    }

    #[tokio::test]
    async fn uncorked_send_flushes_immediately() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut t = Transport::new(server);

        t.send_line("+ ").await.unwrap();

        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+ \r\n");
    }

    #[tokio::test]
    async fn read_detects_peer_close() {
        let (client, server) = tokio::io::duplex(1024);
        let mut t = Transport::new(server);
        drop(client);

        assert!(matches!(
            t.read_input().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn read_with_full_buffer_is_fatal() {
        let (mut client, server) = tokio::io::duplex(MAX_INBUF_SIZE * 2);
        let mut t = Transport::new(server);

        tokio::io::AsyncWriteExt::write_all(&mut client, &vec![b'x'; MAX_INBUF_SIZE])
            .await
            .unwrap();
        while t.inbuf.len() < MAX_INBUF_SIZE {
            t.read_input().await.unwrap();
        }
        assert!(matches!(
            t.read_input().await,
            Err(TransportError::InputBufferFull)
        ));
    }

    #[tokio::test]
    async fn output_overflow_is_fatal() {
        let (_client, server) = tokio::io::duplex(16);
        let mut t = Transport::new(server);

        t.cork();
        // Exactly fills the output bound once the CRLF lands.
        let big = "x".repeat(MAX_OUTBUF_SIZE - 2);
        assert!(t.send_line(&big).await.is_ok());
        assert!(matches!(
            t.send_line("one more").await,
            Err(TransportError::OutputBufferFull)
        ));
    }

    #[tokio::test]
    async fn take_input_returns_buffered_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut t = Transport::new(server);

        tokio::io::AsyncWriteExt::write_all(&mut client, b"a1 NOOP\r\n")
            .await
            .unwrap();
        let n = t.read_input().await.unwrap();
        assert_eq!(n, 9);
        assert_eq!(&t.take_input()[..], b"a1 NOOP\r\n");
        assert_eq!(t.inbuf.len(), 0);
    }
}
