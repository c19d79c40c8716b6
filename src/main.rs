use gbgate::application::{recover, DeviceService, KeepaliveScheduler};
use gbgate::config::Config;
use gbgate::infrastructure::facade::{
    DeviceRegistry, HttpDeviceRegistry, MediaAllocator, SrsMediaAllocator, StaticDeviceRegistry,
};
#[cfg(feature = "redis-store")]
use gbgate::infrastructure::persistence::RedisStore;
use gbgate::infrastructure::persistence::{DistributedRouter, MemoryStore, SessionStore, SharedStore};
use gbgate::infrastructure::protocols::sip::{
    AckHandler, ByeHandler, DeviceEvents, DigestAuthenticator, InviteRejectHandler,
    MessageHandler, OptionsHandler, Registrar, SipMethod, SipServer,
};
use gbgate::interface::api::{build_router, init_metrics, AppState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

async fn shared_store(config: &Config) -> anyhow::Result<Arc<dyn SharedStore>> {
    if config.redis.enabled {
        #[cfg(feature = "redis-store")]
        {
            let store = RedisStore::connect(&config.redis.url).await?;
            info!("Shared store: redis at {}", config.redis.url);
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "redis-store"))]
        warn!("Redis requested but the redis-store feature is disabled");
    }
    warn!("Shared store: in-process memory (single instance only)");
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.as_str())),
        )
        .init();

    info!("Starting gbgate");
    let prometheus_handle = init_metrics()?;

    let sip_config = Arc::new(config.sip.clone());
    let timeout = Duration::from_secs(config.facade.request_timeout_secs);

    // Sessions
    let store = shared_store(&config).await?;
    let router = Arc::new(DistributedRouter::new(store, config.advertise_addr()));
    let sessions = Arc::new(SessionStore::new(router));

    // External collaborators
    let registry: Arc<dyn DeviceRegistry> = match &config.facade.device_registry_url {
        Some(url) => Arc::new(HttpDeviceRegistry::new(url.as_str(), timeout)?),
        None => Arc::new(StaticDeviceRegistry::new(
            config.facade.static_passwords.clone(),
            config.facade.default_password.clone(),
        )),
    };
    let media: Arc<dyn MediaAllocator> = Arc::new(SrsMediaAllocator::new(
        config.facade.media_server_url.as_str(),
        timeout,
    )?);

    // SIP server and state machine
    let sip_server = SipServer::bind(&sip_config).await?;
    let service = DeviceService::new(sip_config.clone(), sessions.clone(), sip_server.client(), media);
    let events: Arc<dyn DeviceEvents> = Arc::new(service.clone());
    let auth = Arc::new(DigestAuthenticator::new(&sip_config.realm, registry));

    sip_server
        .register_handler(
            SipMethod::Register,
            Arc::new(Registrar::new(sip_config.clone(), auth, sessions.clone(), events.clone())),
        )
        .await;
    sip_server
        .register_handler(SipMethod::Message, Arc::new(MessageHandler::new(sessions.clone(), events.clone())))
        .await;
    sip_server
        .register_handler(SipMethod::Options, Arc::new(OptionsHandler::new(sessions.clone())))
        .await;
    sip_server
        .register_handler(SipMethod::Bye, Arc::new(ByeHandler::new(sessions.clone(), events)))
        .await;
    sip_server
        .register_handler(SipMethod::Ack, Arc::new(AckHandler))
        .await;
    sip_server
        .register_handler(SipMethod::Invite, Arc::new(InviteRejectHandler))
        .await;

    // Restore sessions before taking traffic
    recover(&service).await;
    sip_server.start()?;
    info!(
        "SIP listening on {} ({})",
        config.sip.listen_address,
        sip_config.transport_name()
    );

    let scheduler = Arc::new(KeepaliveScheduler::new(service.clone(), sip_config.keepalive_interval()));
    scheduler.start();

    // Operator API
    let app = build_router(AppState::new(service), prometheus_handle);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port)).await?;
    info!("Operator API listening on {}:{}", config.server.host, config.server.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    info!("Shutting down");
    scheduler.stop();
    sip_server.stop();
    Ok(())
}
