use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

use farmgate_settlement as settlement;
use settlement::integrations::{PaymentGateway, RazorpayClient, ShippingCarrier, ShiprocketClient};

#[derive(Parser)]
#[command(name = "farmgate-settlement", about = "Marketplace settlement service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Apply pending migrations before serving
        #[arg(long)]
        migrate: bool,
    },
    /// Apply pending migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = settlement::config::load_config().context("failed to load configuration")?;
    settlement::config::init_tracing(&cfg.log_level, cfg.log_json);

    let db_pool = settlement::db::establish_connection_from_app_config(&cfg).await?;

    let migrate_first = match cli.command.unwrap_or(Command::Serve { migrate: false }) {
        Command::Migrate => {
            settlement::db::run_migrations(&db_pool).await?;
            return Ok(());
        }
        Command::Serve { migrate } => migrate || cfg.auto_migrate,
    };
    if migrate_first {
        settlement::db::run_migrations(&db_pool).await?;
    }

    settlement::metrics::register();
    settlement::handlers::health::init_start_time();

    let (event_tx, event_rx) = mpsc::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(settlement::events::EventSender::new(event_tx));
    tokio::spawn(settlement::events::process_events(event_rx));

    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        RazorpayClient::new(&cfg.payment_gateway).context("failed to build payment gateway client")?,
    );
    let carrier: Arc<dyn ShippingCarrier> = Arc::new(
        ShiprocketClient::new(&cfg.carrier).context("failed to build carrier client")?,
    );

    let db = Arc::new(db_pool);
    let services = settlement::SettlementServices::new(
        db.clone(),
        &cfg,
        gateway,
        carrier,
        Some(event_sender),
    );
    let app = settlement::router(settlement::AppState { db, services });

    let host: std::net::IpAddr = cfg
        .host
        .parse()
        .with_context(|| format!("invalid host address {}", cfg.host))?;
    let addr = SocketAddr::new(host, cfg.port);
    info!("farmgate-settlement listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
