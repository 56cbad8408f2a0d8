use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use dotenv::dotenv;
use log::{info, warn};

use logwarden::api::{self, AppState};
use logwarden::geo::LocationResolver;
use logwarden::{
    AlertManager, DetectionEngine, GeoLocator, IngestionService, LogParser, Settings, SiemStore,
};

fn init_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

// The blocking HTTP client inside the geo resolver must be built before the
// async runtime starts, so `main` stays synchronous and hands over to the
// actix system once the shared state exists.
fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let settings = Arc::new(Settings::from_env());
    info!(
        "starting logwarden (db: {}, blacklist: {} entries)",
        settings.database_path,
        settings.ip_blacklist.len()
    );

    let store = Arc::new(SiemStore::open(&settings.database_path).map_err(init_error)?);
    let resolver: Arc<dyn LocationResolver> = Arc::new(
        GeoLocator::new(settings.maxmind_db_path.as_deref()).map_err(init_error)?,
    );

    match store.prune_expired(settings.alert_retention_days) {
        Ok((alerts, events)) if alerts + events > 0 => {
            info!("retention sweep: dropped {} alerts, {} events", alerts, events)
        }
        Ok(_) => {}
        Err(e) => warn!("retention sweep failed: {}", e),
    }

    let alerts = Arc::new(AlertManager::new(store.clone()));
    let ingestor = Arc::new(IngestionService::new(
        store.clone(),
        LogParser::new(resolver.clone()),
        DetectionEngine::new(settings.clone(), resolver.clone()),
        alerts.clone(),
        resolver,
    ));

    let state = AppState { store, ingestor, alerts };
    serve(state, settings.bind_address.clone())
}

#[actix_web::main]
async fn serve(state: AppState, bind_address: String) -> std::io::Result<()> {
    info!("listening on {}", bind_address);
    let data = web::Data::new(state);

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(api::configure)
    })
    .bind(bind_address)?
    .run()
    .await
}
