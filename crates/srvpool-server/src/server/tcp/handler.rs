//! Per-connection handlers.
//!
//! A [`TcpServer`](super::TcpServer) accepts connections and hands each one to
//! a [`Handler`] in its own task. The handler owns the stream until it
//! returns.

use async_trait::async_trait;
use bytes::BytesMut;
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Serves a single accepted connection.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()>;
}

/// The handler type passed to [`srvpool::Pool::listen`].
pub type SharedHandler = Arc<dyn Handler>;

/// Writes back every byte it reads until the peer closes its write half.
#[derive(Debug, Clone, Copy)]
pub struct EchoHandler {
    buffer_size: usize,
}

impl EchoHandler {
    pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

    pub const fn new(buffer_size: usize) -> Self {
        Self { buffer_size }
    }
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER_SIZE)
    }
}

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(self.buffer_size.max(1));
        let mut echoed = 0usize;

        loop {
            buf.clear();
            if stream.read_buf(&mut buf).await? == 0 {
                break;
            }
            stream.write_all(&buf).await?;
            echoed += buf.len();
        }

        tracing::trace!("Echoed {} bytes to {}", echoed, peer);
        Ok(())
    }
}
