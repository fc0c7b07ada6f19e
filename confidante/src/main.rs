use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use confidante_backend::settings::Settings;
use confidante_backend::store::{SqliteStoreBackend, StoreHandle};
use confidante_core::rate::{normalize_ip, ConnectionRateTable};
use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use confidante_core::xmpp::jid::Jid;
use confidante_inbound::connection::debug::DebugConnection;
use confidante_inbound::connection::tcp::TcpConnection;
use confidante_inbound::{ConnectionType, InboundStreamSettings};
use confidante_inbound::{
    InboundStream,
    sasl::{StoredPassword, StoredPasswordArgon2, StoredPasswordScram},
};
use confidante_outbound::dialback::{self, DialbackConfig, DialbackHandle};
use confidante_services::router::{RouterHandle, RouterSettings};
use sha1::Sha1;
use sha2::Sha256;

/// Grace period given to in-flight connections to see the shutdown
/// broadcast and close cleanly before the process exits.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    AddUser { bare_jid: String, password: String },
    RemoveUser { bare_jid: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::init()?;

    let store_backend = SqliteStoreBackend::new(&settings).await?;
    let store = StoreHandle::new(store_backend);

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::AddUser { bare_jid, password }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            let stored_password_argon2 = StoredPasswordArgon2::new(&password)?.to_string();
            let stored_password_scram_sha1 =
                StoredPasswordScram::<Sha1>::new(&password)?.to_string();
            let stored_password_scram_sha256 =
                StoredPasswordScram::<Sha256>::new(&password)?.to_string();
            store
                .add_user(
                    bare_jid,
                    stored_password_argon2,
                    stored_password_scram_sha1,
                    stored_password_scram_sha256,
                )
                .await?;
        }
        Some(Commands::RemoveUser { bare_jid }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            store.remove_user(bare_jid).await?;
        }
        None => run_server(settings, store).await?,
    }

    Ok(())
}

async fn run_server(
    settings: Settings,
    store: StoreHandle,
) -> Result<(), Error> {
    let (s2s_inbound_tx, s2s_router_rx) = mpsc::channel(64);

    let dialback_config = DialbackConfig {
        secret: settings.router_link.shared_secret.clone(),
        legacy_compat: settings.dialback.legacy_compat,
        not_yet_valid_sweep_interval: settings.dialback.not_yet_valid_sweep_interval,
    };
    let dialback_handle = DialbackHandle::new(dialback_config.clone(), s2s_inbound_tx.clone());

    let router = RouterHandle::new(
        RouterSettings {
            sm_address: settings.router_link.sm_address.clone(),
            component_id: settings.router_link.component_id.clone(),
            shared_secret: settings.router_link.shared_secret.clone(),
            reconnect_attempts: settings.router_link.reconnect_attempts,
            reconnect_delay: settings.router_link.reconnect_delay,
            own_domain: settings.domain.clone(),
        },
        Some(dialback_handle),
        s2s_router_rx,
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let rate_table = Arc::new(std::sync::Mutex::new(ConnectionRateTable::new(
        settings.admission_control.into(),
    )));

    let client_plain_listener = TcpListener::bind(&settings.listen.client_plain).await?;
    let client_tls_listener = TcpListener::bind(&settings.listen.client_tls).await?;
    let server_listener = TcpListener::bind(&settings.listen.server).await?;

    info!(
        client_plain = %settings.listen.client_plain,
        client_tls = %settings.listen.client_tls,
        server = %settings.listen.server,
        "listening"
    );

    let client_plain_task = {
        let settings = settings.clone();
        let router = router.clone();
        let store = store.clone();
        let rate_table = rate_table.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                match client_plain_listener.accept().await {
                    Ok((connection, peer_addr)) => {
                        if !admit(&rate_table, normalize_ip(peer_addr.ip())) {
                            warn!(%peer_addr, "rejecting connection: rate limit exceeded");
                            continue;
                        }

                        let settings = settings.clone();
                        let router = router.clone();
                        let store = store.clone();
                        let shutdown = shutdown_tx.subscribe();

                        tokio::spawn(async move {
                            let connection = TcpConnection::new(
                                connection,
                                settings.tls.server_config.clone(),
                                true,
                            );
                            handle_client_connection(connection, settings, router, store, shutdown)
                                .await;
                        });
                    }
                    Err(error) => warn!(%error, "failed to accept client connection"),
                }
            }
        })
    };

    let client_tls_task = {
        let settings = settings.clone();
        let router = router.clone();
        let store = store.clone();
        let rate_table = rate_table.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(settings.tls.server_config.clone());

            loop {
                match client_tls_listener.accept().await {
                    Ok((connection, peer_addr)) => {
                        if !admit(&rate_table, normalize_ip(peer_addr.ip())) {
                            warn!(%peer_addr, "rejecting connection: rate limit exceeded");
                            continue;
                        }

                        let settings = settings.clone();
                        let router = router.clone();
                        let store = store.clone();
                        let acceptor = acceptor.clone();
                        let shutdown = shutdown_tx.subscribe();

                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(connection).await {
                                Ok(stream) => stream,
                                Err(error) => {
                                    warn!(%error, "direct TLS handshake failed");
                                    return;
                                }
                            };
                            let connection =
                                TcpConnection::new_tls(tls_stream, settings.tls.server_config.clone());
                            handle_client_connection(connection, settings, router, store, shutdown)
                                .await;
                        });
                    }
                    Err(error) => warn!(%error, "failed to accept direct-TLS client connection"),
                }
            }
        })
    };

    let server_task = {
        let own_domain = settings.domain.clone();
        let rate_table = rate_table.clone();
        tokio::spawn(async move {
            loop {
                match server_listener.accept().await {
                    Ok((connection, peer_addr)) => {
                        if !admit(&rate_table, normalize_ip(peer_addr.ip())) {
                            warn!(%peer_addr, "rejecting s2s connection: rate limit exceeded");
                            continue;
                        }

                        let own_domain = own_domain.clone();
                        let dialback_config = dialback_config.clone();
                        let inbound_tx = s2s_inbound_tx.clone();

                        tokio::spawn(async move {
                            if let Err(error) = dialback::accept_connection(
                                connection,
                                &own_domain,
                                &dialback_config,
                                inbound_tx,
                            )
                            .await
                            {
                                debug!(%error, "s2s connection ended");
                            }
                        });
                    }
                    Err(error) => warn!(%error, "failed to accept s2s connection"),
                }
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, notifying active connections");
            let _ = shutdown_tx.send(());
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
        result = client_plain_task => {
            if let Err(error) = result {
                warn!(%error, "client listener task panicked");
            }
        }
        result = client_tls_task => {
            if let Err(error) = result {
                warn!(%error, "direct-TLS client listener task panicked");
            }
        }
        result = server_task => {
            if let Err(error) = result {
                warn!(%error, "s2s listener task panicked");
            }
        }
    }

    Ok(())
}

fn admit(rate_table: &std::sync::Mutex<ConnectionRateTable>, ip: std::net::IpAddr) -> bool {
    rate_table
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .admit(ip, std::time::Instant::now())
}

async fn handle_client_connection(
    connection: TcpConnection,
    settings: Settings,
    router: RouterHandle,
    store: StoreHandle,
    shutdown: broadcast::Receiver<()>,
) {
    let connection = match DebugConnection::try_new(connection).await {
        Ok(connection) => connection,
        Err(error) => {
            warn!(%error, "failed to set up traffic recording for new connection");
            return;
        }
    };
    debug!(uuid = %connection.uuid(), "new client connection");

    let settings = InboundStreamSettings {
        connection_type: ConnectionType::Client,
        domain: settings.domain.clone(),
        tls_required: settings.tls.required_for_clients,
        karma: settings.karma.into(),
        auth_timeout: settings.timeouts.auth_timeout,
        idle_ping_interval: settings.timeouts.idle_ping_interval,
    };
    let mut stream = InboundStream::<_, RustyXmlStreamParser<_>, _>::new(
        connection, router, store, settings, shutdown,
    );
    stream.handle().await;
}
