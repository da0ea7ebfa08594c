use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod handlers;
mod services;
mod upstream;

use bodega_db::repositories::device_repo::DeviceRepository;
use bodega_db::repositories::roster_repo::RosterRepository;
use bodega_db::repositories::team_repo::TeamLoginRepository;
use config::BrokerConfig;
use services::allocation::AllocationService;
use services::device::DeviceService;
use services::rotation::RotationService;
use services::team::TeamAccessService;
use upstream::{HttpSeatService, SeatService};

#[derive(Clone)]
pub struct AppState {
    pub allocation: Arc<AllocationService>,
    pub rotation: Arc<RotationService>,
    pub team: Arc<TeamAccessService>,
    pub devices: DeviceService,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bodega_broker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BrokerConfig::from_env()?;
    tracing::info!("Broker starting, version {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Seat API: {}", config.seat_api_base);

    let pool = bodega_db::connect(&config.database_url).await?;
    tracing::info!("Database ready");

    let seat: Arc<dyn SeatService> = Arc::new(HttpSeatService::new(&config)?);
    let roster_repo = RosterRepository::new(pool.clone());

    let state = AppState {
        allocation: Arc::new(AllocationService::new(
            pool.clone(),
            seat.clone(),
            Arc::new(roster_repo.clone()),
            config.clone(),
        )),
        rotation: Arc::new(RotationService::new(
            pool.clone(),
            roster_repo,
            seat.clone(),
            config.clone(),
        )),
        team: Arc::new(TeamAccessService::new(
            pool.clone(),
            TeamLoginRepository::new(pool.clone()),
            seat,
            config.clone(),
        )),
        devices: DeviceService::new(DeviceRepository::new(pool)),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route(
            "/api/client/account/get",
            post(handlers::client::issue_account),
        )
        .route("/api/client/key/status", get(handlers::client::key_status))
        .route("/api/client/pro/swap", post(handlers::client::swap_pro))
        .route("/api/client/team/login", post(handlers::client::team_login))
        .route(
            "/api/client/device/unbind",
            post(handlers::client::unbind_device),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    tracing::info!("Broker listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
