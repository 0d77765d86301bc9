use std::{net::SocketAddr, sync::Arc};

use tokio::signal;
use tracing::{error, info, warn};

use dropship_api as api;
use dropship_api::notifications::{EmailComposer, LogNotifier, MailApiNotifier, Notifier};
use dropship_api::payments::StripeClient;
use dropship_api::services::{
    FulfillmentService, IntentLease, LocalLease, PayoutRetrier, RedisLease,
};
use dropship_api::supplier::{
    AliExpressClient, CredentialStore, SeaOrmTokenRepository, SupplierApp, TokenRefresher,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db = Arc::new(db_pool);

    let http = api::build_http_client(cfg.http_timeout())?;

    let credentials = Arc::new(CredentialStore::new(
        Arc::new(SeaOrmTokenRepository::new(db.clone())),
        http.clone(),
        SupplierApp::new(
            cfg.ali_app_key.clone(),
            cfg.ali_app_secret.clone(),
            cfg.ali_api_base.clone(),
        ),
    ));
    if credentials.current().await?.is_none() {
        warn!("Supplier account not connected; visit /supplier/oauth/authorize");
    }

    let supplier = Arc::new(
        AliExpressClient::new(http.clone(), credentials.clone())
            .with_logistics_service(cfg.ali_logistics_service.clone()),
    );
    let gateway = Arc::new(StripeClient::new(
        http.clone(),
        cfg.stripe_secret_key.clone(),
        cfg.stripe_api_base.clone(),
    ));

    let composer = EmailComposer::new(cfg.store_name.clone());
    let notifier: Arc<dyn Notifier> = match cfg.mail_api_key.clone() {
        Some(key) => Arc::new(MailApiNotifier::new(
            http.clone(),
            cfg.mail_api_url.clone(),
            key,
            cfg.mail_from.clone(),
            composer,
        )),
        None => {
            warn!("No mail API key configured; customer email will only be logged");
            Arc::new(LogNotifier::new(composer))
        }
    };

    let lease: Arc<dyn IntentLease> = match cfg.redis_url.as_deref() {
        Some(url) => {
            info!("Using Redis intent lease");
            Arc::new(RedisLease::connect(url, cfg.lease_ttl()).await?)
        }
        None => {
            info!("Using in-process intent lease");
            Arc::new(LocalLease::default())
        }
    };

    let fulfillment = Arc::new(
        FulfillmentService::new(gateway, supplier, notifier, lease)
            .with_map_url_template(cfg.mail_map_url_template.clone()),
    );

    // Warm-up is opt-in; requests refresh lazily regardless.
    let refresher = cfg
        .token_warmup_interval()
        .map(|interval| TokenRefresher::spawn(credentials.clone(), interval));
    // Without the sweep, deferred payouts wait for an operator.
    let payout_retrier = cfg
        .payout_retry_interval()
        .map(|interval| PayoutRetrier::spawn(fulfillment.clone(), interval));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    let state = api::AppState::new(Arc::new(cfg), fulfillment, credentials, Some(db));
    let app = api::app_router(state);

    // Bind and serve
    info!("Dropship API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(refresher) = refresher {
        refresher.stop().await;
    }
    if let Some(retrier) = payout_retrier {
        retrier.stop().await;
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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
}
