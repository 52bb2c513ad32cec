//! Inetd mode (§4.7): a single connection already attached to stdin/stdout,
//! served once, then the process exits — `inetd`/`xinetd` own accept and
//! process lifecycle in this mode.

use crate::accesslog::AccessLog;
use crate::handler::{self, HandlerContext, ResponseStyle};
use std::net::IpAddr;
use tokio::io::{self, BufReader};

/// Serves exactly one connection over `stdin`/`stdout`, looping while the
/// client keeps the connection alive, then returns.
pub async fn serve_stdio(ctx: &HandlerContext, access_log: &AccessLog, peer: IpAddr) -> io::Result<()> {
    let mut reader = BufReader::new(io::stdin());
    let mut writer = io::stdout();

    loop {
        let request = match handler::read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!(status = e.status_code(), error = %e, "malformed request on inetd connection");
                let version = handler::read_error_version(&e);
                if let Err(write_err) =
                    handler::write_error_response(&mut writer, version, &e, ResponseStyle::Http).await
                {
                    tracing::warn!(error = %write_err, "failed to write error response");
                }
                return Ok(());
            }
        };

        match handler::handle_request(ctx, &request, peer, &mut writer).await {
            Ok(served) => {
                if let Err(e) = access_log.record(peer, served.status_token, served.bytes_sent, &served.basename) {
                    tracing::warn!(error = %e, "failed to write access log entry");
                }
                if !served.keep_alive {
                    return Ok(());
                }
            }
            Err(e) => {
                tracing::warn!(status = e.status_code(), error = %e, "request failed");
                return Ok(());
            }
        }
    }
}
