use crate::accept_stream::{tcp_accept_stream, tls_handshake};
use crate::handlers::handle_connection;
use crate::registration::RegistrationManager;
use crate::shutdown::Shutdown;
use crate::types::GenericBoxedStream;

use futures_util::StreamExt;
use openssl::ssl::SslAcceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{self, JoinHandle};
use tracing::info;

/// Hand every item of `stream` to `handler` until the stream ends or
/// `shutdown` fires.
pub async fn serve_stream<T>(
    mut stream: GenericBoxedStream<T>,
    shutdown: Arc<Shutdown>,
    handler: impl Fn(T) -> JoinHandle<()> + Send + Sync + 'static,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => {
                info!("Shutdown requested");
                break;
            }
            item = stream.next() => match item {
                Some(item) => {
                    handler(item);
                }
                None => {
                    info!("Stream ended");
                    break;
                }
            },
        }
    }
}

/// Serve the protocol on `listener`, over TLS when an acceptor is given.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<Arc<SslAcceptor>>,
    manager: Arc<RegistrationManager>,
    shutdown: Arc<Shutdown>,
) {
    let stream: GenericBoxedStream<(TcpStream, SocketAddr)> =
        Box::pin(tcp_accept_stream(listener));

    serve_stream(stream, shutdown, move |(tcp, addr): (TcpStream, SocketAddr)| {
        let manager = manager.clone();
        let acceptor = acceptor.clone();
        task::spawn(async move {
            match acceptor {
                Some(acceptor) => {
                    if let Some(tls) = tls_handshake(acceptor, tcp, addr).await {
                        handle_connection(tls, manager).await;
                    }
                }
                None => handle_connection(tcp, manager).await,
            }
        })
    })
    .await;
}
