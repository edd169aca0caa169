pub mod inference;
pub mod models;

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};
use actix_web::middleware::{DefaultHeaders, Logger};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use log::{error, info, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use inference::ModelInference;
use models::{CacheCleared, ErrorBody, HealthResponse, PredictionRequest, PredictionResponse};

const API_KEY_HEADER: &str = "x-api-key";

const RATE_LIMIT_SINGLE: u32 = 100;
const RATE_LIMIT_BATCH: u32 = 20;
const MAX_BATCH_SIZE: usize = 100;
const RATE_LIMIT_MAX_CLIENTS: usize = 10_000;

// API key gate is opt-in: unset API_KEY means open endpoints.
static API_KEY: once_cell::sync::Lazy<Option<String>> =
    once_cell::sync::Lazy::new(|| std::env::var("API_KEY").ok());

// Per-IP counters, reset a minute after the window opened.
static RATE_LIMIT_CACHE: once_cell::sync::Lazy<DashMap<String, (AtomicU32, Instant)>> =
    once_cell::sync::Lazy::new(DashMap::new);

fn over_rate_limit(request: &HttpRequest, max_per_minute: u32) -> bool {
    let Some(client_ip) = request.peer_addr().map(|addr| addr.ip().to_string()) else {
        return false;
    };

    let now = Instant::now();

    // Evict expired windows once the map gets large, so one entry per
    // distinct client IP cannot accumulate forever.
    if RATE_LIMIT_CACHE.len() > RATE_LIMIT_MAX_CLIENTS {
        RATE_LIMIT_CACHE
            .retain(|_, value| now.duration_since(value.1) <= Duration::from_secs(60));
    }

    let mut entry = RATE_LIMIT_CACHE
        .entry(client_ip)
        .or_insert_with(|| (AtomicU32::new(0), now));

    if now.duration_since(entry.1) > Duration::from_secs(60) {
        entry.0.store(0, Ordering::Relaxed);
        entry.1 = now;
    }

    entry.0.fetch_add(1, Ordering::Relaxed) >= max_per_minute
}

fn check_api_key(request: &HttpRequest, expected: Option<&str>) -> Result<(), HttpResponse> {
    let Some(expected) = expected else {
        return Ok(());
    };

    match request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(key) if key == expected => Ok(()),
        Some(_) => Err(HttpResponse::Unauthorized().json(ErrorBody::new("invalid API key"))),
        None => Err(HttpResponse::Unauthorized().json(ErrorBody::new("missing API key"))),
    }
}

fn api_key_guard(request: &HttpRequest) -> Result<(), HttpResponse> {
    check_api_key(request, API_KEY.as_deref())
}

// Deserialization failures go through the same JSON envelope as
// handler-level errors instead of actix's plain-text default.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(64 * 1024)
        .error_handler(|err, _req| {
            let response = HttpResponse::BadRequest().json(ErrorBody::new(&err.to_string()));
            actix_web::error::InternalError::from_response(err, response).into()
        })
}

async fn health_check(model: web::Data<ModelInference>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        model_version: model.version().to_string(),
        uptime_secs: inference::uptime_secs(),
    })
}

async fn model_info(model: web::Data<ModelInference>) -> HttpResponse {
    HttpResponse::Ok().json(model.info())
}

async fn stats() -> HttpResponse {
    HttpResponse::Ok().json(inference::get_stats())
}

async fn predict(
    model: web::Data<ModelInference>,
    req: web::Json<PredictionRequest>,
    request: HttpRequest,
) -> HttpResponse {
    let start_time = Instant::now();

    if over_rate_limit(&request, RATE_LIMIT_SINGLE) {
        warn!("rate limit exceeded for {:?}", request.peer_addr());
        return HttpResponse::TooManyRequests().json(ErrorBody::new("rate limit exceeded"));
    }
    if let Err(response) = api_key_guard(&request) {
        return response;
    }

    if let Err(e) = req.validate() {
        warn!("rejected prediction request: {}", e);
        return HttpResponse::BadRequest().json(ErrorBody::new(&e));
    }

    let model_clone = model.clone();
    let features = req.into_inner().to_array();

    match web::block(move || model_clone.predict(&features)).await {
        Ok(Ok(prediction)) => {
            info!(
                "prediction={:.6} in {}ms",
                prediction,
                start_time.elapsed().as_millis()
            );
            HttpResponse::Ok().json(PredictionResponse::new(prediction))
        }
        Ok(Err(e)) => {
            error!("prediction failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ErrorBody::new(&format!("prediction failed: {}", e)))
        }
        Err(e) => {
            error!("blocking executor error: {}", e);
            HttpResponse::InternalServerError().json(ErrorBody::new("internal execution error"))
        }
    }
}

async fn batch_predict(
    model: web::Data<ModelInference>,
    req: web::Json<Vec<PredictionRequest>>,
    request: HttpRequest,
) -> HttpResponse {
    let start_time = Instant::now();

    if over_rate_limit(&request, RATE_LIMIT_BATCH) {
        warn!("batch rate limit exceeded for {:?}", request.peer_addr());
        return HttpResponse::TooManyRequests().json(ErrorBody::new("rate limit exceeded"));
    }
    if let Err(response) = api_key_guard(&request) {
        return response;
    }

    if req.is_empty() {
        return HttpResponse::BadRequest().json(ErrorBody::new("batch is empty"));
    }
    if req.len() > MAX_BATCH_SIZE {
        return HttpResponse::BadRequest().json(ErrorBody::new(&format!(
            "batch of {} exceeds limit of {}",
            req.len(),
            MAX_BATCH_SIZE
        )));
    }

    for (i, features) in req.iter().enumerate() {
        if let Err(e) = features.validate() {
            return HttpResponse::BadRequest().json(ErrorBody::new(&format!("row {}: {}", i, e)));
        }
    }

    let model_clone = model.clone();
    let rows: Vec<Vec<f64>> = req
        .into_inner()
        .iter()
        .map(|r| r.to_array().to_vec())
        .collect();

    match web::block(move || model_clone.batch_predict(&rows)).await {
        Ok(Ok(predictions)) => {
            info!(
                "batch of {} served in {}ms",
                predictions.len(),
                start_time.elapsed().as_millis()
            );
            let body: Vec<PredictionResponse> = predictions
                .into_iter()
                .map(PredictionResponse::new)
                .collect();
            HttpResponse::Ok().json(body)
        }
        Ok(Err(e)) => {
            error!("batch prediction failed: {}", e);
            HttpResponse::InternalServerError()
                .json(ErrorBody::new(&format!("prediction failed: {}", e)))
        }
        Err(e) => {
            error!("blocking executor error: {}", e);
            HttpResponse::InternalServerError().json(ErrorBody::new("internal execution error"))
        }
    }
}

async fn clear_cache(model: web::Data<ModelInference>, request: HttpRequest) -> HttpResponse {
    if let Err(response) = api_key_guard(&request) {
        return response;
    }
    let cleared = model.clear_cache();
    info!("prediction cache cleared ({} entries)", cleared);
    HttpResponse::Ok().json(CacheCleared { cleared })
}

async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(ErrorBody::new("endpoint not found"))
}

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/model-info", web::get().to(model_info))
        .route("/stats", web::get().to(stats))
        .route("/predict", web::post().to(predict))
        .route("/batch-predict", web::post().to(batch_predict))
        .route("/clear-cache", web::post().to(clear_cache))
        .default_service(web::route().to(not_found));
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format_module_path(false)
        .init();

    info!("🚀 Starting prediction API");
    inference::mark_started();

    let model_path =
        std::env::var("MODEL_PATH").unwrap_or_else(|_| "models/linear_regression.json".to_string());

    let model = match ModelInference::load(&model_path) {
        Ok(model) => {
            info!(
                "✅ Model loaded from {} (version {}, {} features)",
                model_path,
                model.version(),
                model.n_features()
            );
            model
        }
        Err(e) => {
            error!("❌ Cannot load model from {}: {}", model_path, e);
            std::process::exit(1);
        }
    };

    // The request schema is fixed at compile time; a mismatched
    // artifact would fail every request, so refuse to start.
    if model.n_features() != PredictionRequest::NUM_FEATURES {
        error!(
            "❌ Artifact expects {} features but the request schema has {}",
            model.n_features(),
            PredictionRequest::NUM_FEATURES
        );
        std::process::exit(1);
    }

    let model_data = web::Data::new(model);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "8000".to_string());
    let workers = std::env::var("WORKERS")
        .ok()
        .and_then(|w| w.parse().ok())
        .unwrap_or_else(num_cpus::get);

    let bind_address = format!("{}:{}", host, port);

    info!("🌐 Listening on http://{}", bind_address);
    info!("👷 Workers: {}", workers);
    info!("🔧 Endpoints:");
    info!("   GET  /health         - liveness and model version");
    info!("   GET  /model-info     - artifact metadata");
    info!("   GET  /stats          - service counters");
    info!("   POST /predict        - single prediction");
    info!("   POST /batch-predict  - batched predictions");
    info!("   POST /clear-cache    - drop cached predictions");

    HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![
                header::CONTENT_TYPE,
                HeaderName::from_static(API_KEY_HEADER),
            ])
            .max_age(3600);
        cors = match std::env::var("CORS_ORIGIN") {
            Ok(origin) => cors.allowed_origin(&origin),
            Err(_) => cors.allow_any_origin(),
        };

        App::new()
            .wrap(Logger::default())
            .wrap(DefaultHeaders::new().add(("X-Content-Type-Options", "nosniff")))
            .wrap(cors)
            .app_data(model_data.clone())
            .app_data(json_config())
            .configure(configure_routes)
    })
    .workers(workers)
    .bind(&bind_address)?
    .run()
    .await
}
