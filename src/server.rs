//! HTTPS listener: TCP accept, TLS handshake on its own task, warp serving.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::*;
use warp::{Filter, Rejection, Reply};

use crate::shutdown::ShutdownSignal;

/// Handshakes that do not finish in time are dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Established connections waiting to be picked up by the HTTP server
const READY_BACKLOG: usize = 128;

/// Serve `routes` over TLS on `listener` until `shutdown` fires and every
/// in-flight request has drained.
pub async fn serve_tls<F>(
    routes: F,
    listener: TcpListener,
    config: Arc<ServerConfig>,
    shutdown: ShutdownSignal,
) where
    F: Filter<Error = Rejection> + Clone + Send + Sync + 'static,
    F::Extract: Reply,
{
    let (tx, rx) = mpsc::channel(READY_BACKLOG);
    let accepting = tokio::spawn(accept(listener, TlsAcceptor::from(config), tx, shutdown.clone()));

    let incoming = Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|stream| (Ok::<_, io::Error>(stream), rx))
    }));
    warp::serve(routes)
        .serve_incoming_with_graceful_shutdown(incoming, shutdown.recv())
        .await;

    accepting.abort();
    debug!("https server stopped");
}

async fn accept(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<TlsStream<TcpStream>>,
    shutdown: ShutdownSignal,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening for admission requests");
    }

    let stop = shutdown.recv();
    tokio::pin!(stop);
    loop {
        let accepted = tokio::select! {
            _ = &mut stop => break,
            res = listener.accept() => res,
        };
        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "could not accept connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    // the server is gone once shutdown completes
                    let _ = ready.send(tls).await;
                }
                Ok(Err(err)) => debug!(%peer, error = %err, "TLS handshake failed"),
                Err(_) => debug!(%peer, "TLS handshake timed out"),
            }
        });
    }
    debug!("stopped accepting connections");
}
