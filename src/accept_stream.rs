use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures_util::Stream;
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tracing::{debug, error};

/// Accepted TCP connections. Accept errors are logged and skipped.
pub fn tcp_accept_stream(listener: TcpListener) -> impl Stream<Item = (TcpStream, SocketAddr)> {
    stream! {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    yield (stream, addr);
                }
                Err(e) => {
                    error!("TCP accept error: {}", e);
                }
            }
        }
    }
}

/// Run the server side of a TLS handshake on an accepted connection.
///
/// Done per connection, off the accept loop, so a slow client cannot hold
/// up the others.
pub async fn tls_handshake(
    acceptor: Arc<SslAcceptor>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Option<SslStream<TcpStream>> {
    let ssl = match Ssl::new(acceptor.context()) {
        Ok(ssl) => ssl,
        Err(e) => {
            error!("Failed to create SSL context for {}: {}", addr, e);
            return None;
        }
    };

    let mut ssl_stream = match SslStream::new(ssl, stream) {
        Ok(ssl_stream) => ssl_stream,
        Err(e) => {
            error!("Failed to create SSL stream for {}: {}", addr, e);
            return None;
        }
    };

    match Pin::new(&mut ssl_stream).accept().await {
        Ok(()) => {
            debug!("TLS handshake successful with {}", addr);
            Some(ssl_stream)
        }
        Err(e) => {
            error!("TLS handshake failed with {}: {}", addr, e);
            None
        }
    }
}
