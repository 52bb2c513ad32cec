//! Daemon entry point (§4.7 "Listener / Workers", §6 "External interfaces").
//!
//! Parses the CLI surface, loads the configuration record, opens the
//! content store and upstream fetcher, and dispatches to standalone,
//! inetd, or CGI mode. Process-daemonisation (`fork`, `chroot`,
//! `user`/`group`, `pidfile`) is listed as an external collaborator in the
//! specification ("CLI/flag surface, and process-daemonisation plumbing");
//! this binary accepts and validates those configuration keys but does not
//! act on them — a real deployment is expected to run it under its own
//! supervisor (systemd, runit, inetd itself) rather than have it fork.

use anyhow::Context;
use clap::Parser;
use pkg_cacher_cache::Coordinator;
use pkg_cacher_config::SharedConfig;
use pkg_cacher_net::{Fetcher, TransportOptions};
use pkg_cacher_server::{accesslog::AccessLog, cgi, handler::HandlerContext, inetd, listener};
use pkg_cacher_store::{CacheLayout, ContentStore};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Fixed per §5 "Upstream connect timeout: fixed short budget (≈10s)".
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Command-line options accepted by the `pkg-cacherd` daemon.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// Path to the directive-file configuration.
    #[clap(short, long, default_value = "/etc/pkg-cacher/pkg-cacher.conf")]
    config: PathBuf,

    /// Serve exactly one connection already attached to stdin/stdout, then exit.
    #[clap(long, conflicts_with = "cgi")]
    inetd: bool,

    /// Serve exactly one request described by the CGI environment, then exit.
    #[clap(long)]
    cgi: bool,

    /// Log verbose (debug-level) output regardless of `debug` in the config file.
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let num_cores = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(2)
        .max(2);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cores / 2)
        .max_blocking_threads(num_cores)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let default_filter = if opt.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .context("invalid RUST_LOG directive")?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let shared_config = SharedConfig::load(&opt.config)
        .with_context(|| format!("loading configuration from {}", opt.config.display()))?;
    warn_on_unenforced_daemon_options(&shared_config);

    let config = shared_config.current();
    std::fs::create_dir_all(&config.logdir)
        .with_context(|| format!("creating log directory {}", config.logdir.display()))?;

    let layout = CacheLayout::new(config.cache_dir.clone());
    let store = Arc::new(ContentStore::open(layout).context("opening the content store")?);

    let transport = TransportOptions {
        http_proxy: config.proxy.http_proxy.clone(),
        https_proxy: config.proxy.https_proxy.clone(),
        http_proxy_auth: config.proxy.http_proxy_auth.clone(),
        https_proxy_auth: config.proxy.https_proxy_auth.clone(),
        require_valid_ssl: config.require_valid_ssl,
        use_interface: config.use_interface.clone(),
        connect_timeout: CONNECT_TIMEOUT,
    };
    let client = pkg_cacher_net::build_client(&transport).context("building the upstream HTTP client")?;
    let fetcher = Arc::new(Fetcher::new(client, Duration::from_secs(config.fetch_timeout), config.limit));
    let coordinator = Arc::new(Coordinator::new(store, fetcher));

    let access_log = Arc::new(
        AccessLog::open(config.logdir.join("access.log")).context("opening the access log")?,
    );

    let ctx = HandlerContext { config: shared_config.clone(), coordinator };

    if opt.cgi {
        let mut stdout = tokio::io::stdout();
        return cgi::serve_one(&ctx, &access_log, &mut stdout).await.context("serving CGI request");
    }

    if opt.inetd {
        let peer = inetd_peer_address();
        return inetd::serve_stdio(&ctx, &access_log, peer).await.context("serving inetd connection");
    }

    run_standalone(ctx, access_log, shared_config).await
}

/// Binds the configured addresses and serves connections until `SIGTERM`,
/// reloading on `SIGHUP` and toggling the debug flag on `SIGUSR1` (§5
/// "Cancellation and timeouts").
async fn run_standalone(
    ctx: HandlerContext,
    access_log: Arc<AccessLog>,
    shared_config: SharedConfig,
) -> anyhow::Result<()> {
    let config = shared_config.current();
    let listeners = listener::bind_all(&config.daemon_addr, config.daemon_port, config.retry)
        .await
        .context("binding the standalone listener")?;
    tracing::info!(addrs = ?config.daemon_addr, port = config.daemon_port, "listening");

    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    let serve_task = tokio::spawn(listener::serve(listeners, ctx, access_log, serve_shutdown));

    signal_loop(&shared_config, shutdown.clone()).await;
    shutdown.cancel();
    serve_task.await.context("listener task panicked")?;
    Ok(())
}

/// Waits for `SIGTERM` (shutdown), handling any number of `SIGHUP` (reload)
/// and `SIGUSR1` (debug toggle) signals in the meantime. Returns once the
/// process should exit.
#[cfg(unix)]
async fn signal_loop(shared_config: &SharedConfig, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut usr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");

    loop {
        tokio::select! {
            _ = term.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                return;
            }
            _ = shutdown.cancelled() => return,
            _ = hup.recv() => {
                match shared_config.reload() {
                    Ok(_) => tracing::info!("configuration reloaded"),
                    Err(e) => tracing::error!(error = %e, "configuration reload failed, keeping previous config"),
                }
            }
            _ = usr1.recv() => {
                let debug = shared_config.toggle_debug();
                tracing::info!(debug, "debug flag toggled");
            }
        }
    }
}

#[cfg(not(unix))]
async fn signal_loop(_shared_config: &SharedConfig, _shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
}

/// Daemon lifecycle keys (`user`, `group`, `chroot`, `pidfile`, `fork`) are
/// an external collaborator per the specification: recognised and stored
/// by the configuration record, but their effects (privilege drop,
/// `chroot(2)`, writing a pidfile, backgrounding the process) are the
/// responsibility of whatever supervises this binary.
fn warn_on_unenforced_daemon_options(shared_config: &SharedConfig) {
    let config = shared_config.current();
    if config.fork {
        tracing::warn!("`fork` is set but this binary never backgrounds itself; run it under a supervisor instead");
    }
    if config.user.is_some() || config.group.is_some() {
        tracing::warn!("`user`/`group` are set but privilege drop is not performed by this binary");
    }
    if config.chroot.is_some() {
        tracing::warn!("`chroot` is set but this binary does not chroot(2) itself");
    }
    if let Some(pidfile) = &config.pidfile {
        tracing::warn!(path = %pidfile.display(), "`pidfile` is set but this binary does not write one");
    }
}

/// Best-effort client identity for inetd mode: a TCP-wrapper-style
/// environment variable if the supervisor sets one, otherwise loopback
/// (the connection is already local to this process's stdio either way).
fn inetd_peer_address() -> IpAddr {
    for var in ["TCPREMOTEIP", "REMOTE_HOST", "PROXY_REMOTE_ADDR"] {
        if let Ok(value) = std::env::var(var) {
            if let Ok(addr) = value.parse() {
                return addr;
            }
        }
    }
    IpAddr::from([127, 0, 0, 1])
}
