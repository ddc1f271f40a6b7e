use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pinhost_acme::{ChallengeStore, Issuer, IssuerConfig};
use pinhost_config::{Config, Dirs};
use pinhost_dns::{DnsServer, ZoneSigner};
use pinhost_node::api::{self, AppState};
use pinhost_node::supervise::{wait_for_signal, ShutdownHooks};
use pinhost_node::{http, https, NodeError};
use pinhost_store::network::http::{router as rpc_router, HttpNetwork};
use pinhost_store::peers::CLUSTER_PORT;
use pinhost_store::{default_raft_config, hygiene, node_id_for, ops, peers, ReplStore};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run()) {
        tracing::error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), NodeError> {
    let dirs = Dirs::from_env();
    let config = Config::load(&dirs)?;
    tracing::info!(
        origin = %config.origin,
        state_dir = %dirs.state_dir().display(),
        "starting pinhost"
    );

    // Replicated store first: everything else reads or writes through it.
    let self_v6 = peers::my_ipv6().await?;
    let transport_addr = format!("[{self_v6}]:{CLUSTER_PORT}");
    let node_id = node_id_for(&transport_addr);
    tracing::info!(node_id, addr = %transport_addr, "cluster transport address");

    let store = Arc::new(
        ReplStore::open(
            node_id,
            &transport_addr,
            default_raft_config(),
            HttpNetwork::new(),
            &dirs.raft_dir(),
        )
        .await?,
    );

    let rpc_listen: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), CLUSTER_PORT);
    let rpc_listener = tokio::net::TcpListener::bind(rpc_listen)
        .await
        .map_err(|e| NodeError::Bind { address: rpc_listen.to_string(), source: e })?;
    let rpc = rpc_router(store.rpc_context());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(rpc_listener, rpc).await {
            tracing::error!("cluster transport listener exited: {e}");
        }
    });

    let peer_list = peers::read_peers_file(&dirs.peers_file(), self_v6).await?;
    store.form_cluster(&peer_list, config.cluster_timeout()).await?;
    ops::serve(Arc::clone(&store)).await?;

    // Authoritative DNS.
    let zone = pinhost_dns::zone::load_zone_file(&dirs.zone_file(), &config.origin)?;
    let signer =
        Arc::new(ZoneSigner::load_or_generate(&dirs.dns_key_file(), &config.origin)?);
    let backend = pinhost_dns::build_backend(
        &config.origin,
        &config.ca_domain,
        zone,
        &signer,
        Arc::clone(&store),
    )?;
    let dns_listen: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 53);
    let dns = DnsServer::start(dns_listen, backend, signer).await?;

    // ACME account, shared by client issuance and our own listener cert.
    let client = pinhost_acme::open_account(
        &config.acme_directory_url,
        &dirs.acme_account_file(),
        &dirs.eab_file(),
        config.contact.as_deref(),
    )
    .await?;

    let cancel = CancellationToken::new();
    let challenges = ChallengeStore::new();

    // :80 comes up before the self-cert order so the CA can fetch tokens.
    let http_listen: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 80);
    http::serve_http(http_listen, config.origin.clone(), challenges.clone(), cancel.clone())
        .await?;

    let self_cert =
        pinhost_acme::selfcert::ensure_self_cert(&client, &store, &challenges, &config.origin)
            .await?;

    let issuer = Arc::new(Issuer::new(
        Arc::clone(&client),
        Arc::clone(&store),
        IssuerConfig {
            min_life: config.min_cert_life(),
            retries: config.acme_retries,
            retry_delay: config.acme_retry_delay(),
            timeout: config.acme_timeout(),
        },
    ));

    let router = api::router(AppState {
        origin: config.origin.clone(),
        issuer,
        www_dir: dirs.www_dir(),
    });
    let https_listen: SocketAddr =
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 443);
    https::serve_https(https_listen, router, self_cert.clone(), cancel.clone()).await?;

    // Background maintenance.
    tokio::spawn(hygiene::hygiene_loop(Arc::clone(&store), cancel.clone()));
    tokio::spawn(pinhost_acme::selfcert::renewal_loop(
        client,
        Arc::clone(&store),
        challenges,
        config.origin.clone(),
        self_cert,
        cancel.clone(),
    ));

    tracing::info!("pinhost is up");
    wait_for_signal().await;
    tracing::info!("signal received, shutting down");

    let mut hooks = ShutdownHooks::new(config.shutdown_timeout());
    let listeners_cancel = cancel.clone();
    hooks.register("listeners", move || async move {
        listeners_cancel.cancel();
    });
    hooks.register("dns server", move || dns.stop());
    let shutdown_timeout = config.shutdown_timeout();
    hooks.register("store handover", move || async move {
        store.shutdown_handover(shutdown_timeout).await;
    });
    hooks.run().await;

    tracing::info!("shutdown complete");
    Ok(())
}
