//! TCP transport for chat connections.

use std::net::SocketAddr;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};

use crate::chat::error::ChatError;
use crate::chat::transport::Framed;

/// A framed TCP connection.
pub type TcpConnection = Framed<OwnedReadHalf, OwnedWriteHalf>;

impl TcpConnection {
    /// Wrap an accepted or connected stream.
    pub fn from_stream(stream: TcpStream, max_frame_len: usize) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        Framed::with_max_frame_len(read_half, write_half, peer_addr, max_frame_len)
    }

    /// Connect to a remote address.
    pub async fn connect<A: ToSocketAddrs>(addr: A, max_frame_len: usize) -> Result<Self, ChatError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, max_frame_len))
    }
}

/// TCP listener for accepting chat connections.
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    /// Bind to an address and start listening.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ChatError> {
        let listener = TokioTcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept a new raw stream.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ChatError> {
        Ok(self.listener.accept().await?)
    }

    /// Get the local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(self.listener.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::config::DEFAULT_MAX_FRAME_LEN;
    use crate::chat::protocol::{ClientMessage, Login};
    use crate::chat::transport::MessageTransport;

    #[tokio::test]
    async fn test_tcp_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_task = tokio::spawn(async move {
            let mut conn = TcpConnection::connect(addr, DEFAULT_MAX_FRAME_LEN)
                .await
                .unwrap();
            for i in 0..10 {
                let msg = ClientMessage::Login(Login {
                    nickname: format!("msg{}", i),
                });
                conn.send(&msg).await.unwrap();
            }
            conn.close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut server_conn = TcpConnection::from_stream(stream, DEFAULT_MAX_FRAME_LEN);

        for i in 0..10 {
            let msg: ClientMessage = server_conn.receive().await.unwrap().unwrap();
            assert_eq!(
                msg,
                ClientMessage::Login(Login {
                    nickname: format!("msg{}", i)
                })
            );
        }
        assert!(server_conn.receive::<ClientMessage>().await.unwrap().is_none());

        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpConnection::connect(addr, DEFAULT_MAX_FRAME_LEN).await;
        assert!(result.is_err());
    }
}
