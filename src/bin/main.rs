use std::error::Error;
use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use overlay_controller::cli::Cli;
use overlay_controller::clients::ClientManager;
use overlay_controller::config::ControllerConfig;
use overlay_controller::events::{audit::spawn_history_writers, EventBus};
use overlay_controller::http::{self, AppState};
use overlay_controller::ipam::Pool;
use overlay_controller::logging::Logging;
use overlay_controller::nodes::NodeManager;
use overlay_controller::overlay::memory::InMemoryOverlayDriver;
use overlay_controller::overlay::OverlayDriver;
use overlay_controller::policy::access::UserDirectory;
use overlay_controller::policy::PolicyEngine;
use overlay_controller::store::postgres::PgStore;
use overlay_controller::store::Store;
use overlay_controller::trust::TrustEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    Logging::try_init()?;

    let cli = Cli::init();
    let config = ControllerConfig::load(&cli.config_path())?;

    if cli.print_config() {
        println!("{config:#?}");
        return Ok(());
    }

    let bind_address = config.bind_address.clone();

    let pool = PgPoolOptions::new().connect(&config.database_url).await?;
    let pg_store = PgStore::new(pool);
    pg_store.run_migrations().await?;
    let store: Arc<dyn Store> = Arc::new(pg_store);

    // No real WireGuard-style backend is in scope (§4.5 "overlay driver as
    // capability" treats the trait itself as the deliverable); the in-memory
    // fake is wired here as the only concrete driver the crate ships.
    let overlay: Arc<dyn OverlayDriver> = Arc::new(InMemoryOverlayDriver::new());

    let events = EventBus::default();
    spawn_history_writers(&events, store.clone());

    let node_pool = Pool::node_pool(config.overlay_network, config.overlay_gateway);
    let client_pool = Pool::client_pool(
        config.overlay_network,
        config.overlay_gateway,
        config.client_ip_pool_start,
        config.client_ip_pool_end,
    );

    let hub_endpoint = config.hub_endpoint.clone().unwrap_or_default();

    let nodes = NodeManager::new(
        store.clone(),
        overlay.clone(),
        events.clone(),
        node_pool,
        config.auto_approve_all,
        config.auto_approve_roles.clone(),
    );

    let policy = PolicyEngine::new(
        store.clone(),
        events.clone(),
        config.hub_public_key.clone(),
        hub_endpoint.clone(),
        config.overlay_network.to_string(),
    );

    let trust = TrustEngine::new(store.clone(), overlay.clone(), events.clone());

    let clients = ClientManager::new(
        store.clone(),
        events.clone(),
        client_pool,
        config.client_max_devices_per_user,
        config.client_default_expires_days,
        config.client_require_admin_approval,
        config.hub_public_key.clone(),
        hub_endpoint,
        config.dns_servers.iter().map(|ip| ip.to_string()).collect(),
    );

    let directory = UserDirectory::new(store.clone());

    let state = web::Data::new(AppState {
        config,
        store,
        overlay,
        nodes,
        policy,
        trust,
        clients,
        directory,
    });

    info!(address = %bind_address, "starting the overlay controller HTTP server");
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(http::configure))
        .bind(&bind_address)?
        .run();

    // Channel to hand the server's handle back out of the spawned task, the
    // same shape as the teacher's `run_status_server`: the Ctrl-C handler
    // only needs to call `stop`, it never needs to reach into the server
    // future itself.
    let (handle_tx, handle_rx) = std::sync::mpsc::channel::<ServerHandle>();
    let _ = handle_tx.send(server.handle());

    let shutdown_handle = handle_rx.recv().expect("server handle was sent before awaiting it");
    ctrlc::set_handler(move || {
        info!("Ctrl-C received, stopping the HTTP server");
        futures::executor::block_on(shutdown_handle.stop(true));
    })
    .map_err(|e| {
        error!(error = %e, "could not set Ctrl-C handler");
        e
    })?;

    server.await?;
    Ok(())
}
