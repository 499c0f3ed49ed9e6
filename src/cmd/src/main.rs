use clap::Parser;
use common::ShutdownMessage;
use proxy::protocol::pop3::Pop3Driver;
use proxy::server::client::ClientSession;
use proxy::server::manager::ProxyManager;
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::proxy_conn::ProxyConnection;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("MailProxy receive ctrl_c signal {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("MailProxy receive terminate signal {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

/// Build the per-connection client session from the CLI-supplied static
/// login data. A real deployment gets these fields from the login daemon's
/// passdb lookup; this binary proxies every accepted connection the same
/// way.
fn new_client_session(args: &ProxyServerArgs, stream: &TcpStream) -> anyhow::Result<ClientSession> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    let mut client = ClientSession::new(&args.proxy_user, &args.proxy_user);
    client.proxy_master_user = args.proxy_master_user.clone();
    client.proxy_password = args.proxy_password.clone();
    client.proxy_mech = args.mechanism()?;
    client.set_proxy_ttl(args.proxy_ttl);
    client.ip = peer.ip();
    client.remote_port = peer.port();
    client.local_ip = Some(local.ip());
    client.local_port = local.port();
    client.set = args.client_settings();
    Ok(client)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let works = proxy_config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("MAIL_PROXY")
        .worker_threads(works)
        .build()?;

    info!("MailProxy running config args={:?}", proxy_config);
    runtime.block_on(async {
        let settings = proxy_config.proxy_settings()?;
        let manager = Arc::new(ProxyManager::new("pop3"));

        let port = proxy_config.port;
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("MailProxy listening on port {port}, backend {}", settings.host);
        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    if let ShutdownMessage::Cancel(msg) = shutdown_msg {
                        info!("MailProxy process receive shutdown msg {msg}");
                    }
                    manager.shutdown().await;
                    break;
                }
                rs = tcp_listener.accept() => {
                    match rs {
                        Ok((stream, _addr)) => {
                            let client = match new_client_session(&proxy_config, &stream) {
                                Ok(client) => Arc::new(client),
                                Err(e) => {
                                    warn!("MailProxy failed to set up client session. cause by {e:?}");
                                    continue;
                                }
                            };
                            let driver = Box::new(Pop3Driver::new(
                                Arc::clone(&client),
                                settings.ssl_flags,
                            ));
                            let conn = ProxyConnection::new(
                                Arc::clone(&manager),
                                client,
                                settings.clone(),
                                driver,
                            );
                            let (client_reader, client_writer) = stream.into_split();
                            tokio::spawn(conn.run(client_reader, client_writer));
                        }
                        Err(e) => {
                            warn!("MailProxy accept connection err. cause by {e:?}");
                        }
                    }
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
