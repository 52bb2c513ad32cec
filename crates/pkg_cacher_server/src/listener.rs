//! Standalone listener (§4.7): one `TcpListener` per configured bind
//! address, `SO_REUSEADDR`, retrying a configurable number of times; one
//! `tokio::task` per accepted connection so a slow client or a stalled
//! upstream never blocks others (§5 "preemptive parallel workers").

use crate::accesslog::AccessLog;
use crate::handler::{self, HandlerContext, ResponseStyle};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

/// Binds one listening socket per address in `addrs`, retrying each bind up
/// to `retry` times with a short backoff (§4.7 "retrying for a configurable
/// number of attempts").
pub async fn bind_all(addrs: &[IpAddr], port: u16, retry: u32) -> io::Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        listeners.push(bind_with_retry(SocketAddr::new(*addr, port), retry).await?);
    }
    Ok(listeners)
}

async fn bind_with_retry(addr: SocketAddr, retry: u32) -> io::Result<TcpListener> {
    let mut attempt = 0;
    loop {
        match bind_reuseaddr(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < retry => {
                attempt += 1;
                tracing::warn!(%addr, attempt, error = %e, "bind failed, retrying");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn bind_reuseaddr(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// Accepts connections on every listener in `listeners` until `shutdown` is
/// cancelled, spawning one handler task per connection.
pub async fn serve(
    listeners: Vec<TcpListener>,
    ctx: HandlerContext,
    access_log: Arc<AccessLog>,
    shutdown: CancellationToken,
) {
    let mut tasks = tokio::task::JoinSet::new();
    for listener in listeners {
        let ctx = ctx.clone();
        let access_log = access_log.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(accept_loop(listener, ctx, access_log, shutdown));
    }
    while tasks.join_next().await.is_some() {}
}

async fn accept_loop(
    listener: TcpListener,
    ctx: HandlerContext,
    access_log: Arc<AccessLog>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let access_log = access_log.clone();
                tokio::spawn(handle_connection(stream, peer.ip(), ctx, access_log));
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: IpAddr,
    ctx: HandlerContext,
    access_log: Arc<AccessLog>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);

    loop {
        let request = match handler::read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(%peer, status = e.status_code(), error = %e, "malformed request");
                let version = handler::read_error_version(&e);
                if let Err(write_err) =
                    handler::write_error_response(&mut write_half, version, &e, ResponseStyle::Http).await
                {
                    tracing::warn!(%peer, error = %write_err, "failed to write error response");
                }
                return;
            }
        };

        match handler::handle_request(&ctx, &request, peer, &mut write_half).await {
            Ok(served) => {
                if let Err(e) = access_log.record(peer, served.status_token, served.bytes_sent, &served.basename) {
                    tracing::warn!(error = %e, "failed to write access log entry");
                }
                if !served.keep_alive {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(%peer, status = e.status_code(), error = %e, "request failed");
                return;
            }
        }
    }
}
