//! A connected TCP socket shared by every in-flight operation of one
//! connection.
//!
//! Reads and writes go through tokio's readiness API on `&TcpStream`, so a
//! receive and a write can be in flight at once without splitting the stream.
//! Shutdown is synchronous through `socket2::SockRef`.

use std::io;
use std::net::{Shutdown, SocketAddr};

use socket2::SockRef;
use tokio::net::TcpStream;

#[derive(Debug)]
pub(crate) struct SocketIo {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl SocketIo {
    pub(crate) fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self { stream, peer }
    }

    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    /// Reads into `buf`. Returns 0 once the peer or a local shutdown has
    /// closed the read side.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        debug_assert!(!buf.is_empty(), "receive armed with an empty window");
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                result => return result,
            }
        }
    }

    /// Writes some prefix of `buf`.
    pub(crate) async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            self.stream.writable().await?;
            match self.stream.try_write(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                result => return result,
            }
        }
    }

    pub(crate) fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        SockRef::from(&self.stream).shutdown(how)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (SocketIo, SocketIo) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            SocketIo::new(client.unwrap()),
            SocketIo::new(accepted.unwrap().0),
        )
    }

    #[tokio::test]
    async fn write_then_read() {
        let (a, b) = pair().await;
        let n = a.write(b"hello").await.unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            read += b.read(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"hello");
        assert_eq!(a.peer_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn shutdown_is_seen_as_zero_byte_read() {
        let (a, b) = pair().await;
        a.shutdown(Shutdown::Write).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
