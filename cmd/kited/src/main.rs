use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer};
use clap::Parser;
use kite_core::telemetry::LogFormat;
use kite_core::{Controller, ControllerOptions};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

/// Pluggable Kubernetes controller daemon.
///
/// Ships with no plugins registered; embedders depend on `kite-core` and
/// call `Controller::register_plugin` before `run()` to add their own.
#[derive(Parser, Debug)]
#[command(name = "kited", version)]
struct Args {
    #[arg(long, env = "KITE_CONTROLLER_ID", default_value = "kite")]
    controller_id: String,

    #[arg(long, env = "KITE_CONFIG_MAP_NAMESPACE", default_value = "kube-system")]
    config_map_namespace: String,

    /// Defaults to "{controller-id}-config" when unset.
    #[arg(long, env = "KITE_CONFIG_MAP_NAME")]
    config_map_name: Option<String>,

    #[arg(long, env = "KITE_STORE_ENABLED", default_value_t = true)]
    store_enabled: bool,

    #[arg(long, env = "KITE_STORE_NAMESPACE", default_value = "kube-system")]
    store_namespace: String,

    /// Defaults to "{controller-id}-store" when unset.
    #[arg(long, env = "KITE_STORE_NAME")]
    store_name: Option<String>,

    #[arg(long, env = "KITE_PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, env = "KITE_LOG_FILTER", default_value = "info")]
    log_filter: String,

    #[arg(long, env = "KITE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    kite_core::telemetry::init(&args.log_filter, args.log_format);

    let config_map_name = args
        .config_map_name
        .clone()
        .unwrap_or_else(|| format!("{}-config", args.controller_id));
    let store_name = args
        .store_name
        .clone()
        .unwrap_or_else(|| format!("{}-store", args.controller_id));

    let mut metrics_registry = Registry::default();
    let kube_config = kube::Config::infer().await?;
    let client =
        kite_k8s_util::client::new_client_with_metrics(kube_config, &mut metrics_registry).await?;
    let metrics = Arc::new(kite_core::metrics::ControllerMetrics::new(&mut metrics_registry));

    let options = ControllerOptions {
        controller_id: args.controller_id.clone(),
        config_map_namespace: args.config_map_namespace.clone(),
        config_map_name,
        store_enabled: args.store_enabled,
        store_namespace: args.store_namespace.clone(),
        store_name,
    };

    let mut controller = Controller::new(client, options, metrics);

    let registry = web::Data::new(Arc::new(metrics_registry));
    let port = args.port;
    let server = HttpServer::new(move || {
        App::new()
            .app_data(registry.clone())
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .bind(("0.0.0.0", port))?
    .run();

    tracing::info!(controller_id = %args.controller_id, port, "kited starting");

    tokio::select! {
        result = controller.run() => result.map_err(|e| e.into()),
        result = server => result.map_err(|e| e.into()),
    }
}

async fn metrics_handler(registry: web::Data<Arc<Registry>>) -> HttpResponse {
    let mut buffer = String::new();
    match encode(&mut buffer, &registry) {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(buffer),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn health_handler() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}
