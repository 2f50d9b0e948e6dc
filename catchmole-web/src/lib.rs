//! # catchmole-web
//!
//! The HTTP surface: JSON API for the UI, Prometheus exposition, and the
//! embedded static pages. Handlers only call the aggregator's snapshot and
//! reset methods; all statistics live behind its lock.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{web, App, HttpResponse, HttpServer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use catchmole_stats::{Aggregator, ClientStats, FlowDetail};
use catchmole_telemetry::MetricsRecorder;

const CLIENTS_PAGE: &str = include_str!("../assets/clients.html");
const CLIENT_PAGE: &str = include_str!("../assets/client.html");
const STYLESHEET: &str = include_str!("../assets/style.css");

/// Shared handler state.
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub metrics: MetricsRecorder,
    pub ip_tools: BTreeMap<String, String>,
}

/// Binds the listen address and returns the running server future.
pub fn run_server(listen: &str, state: AppState) -> io::Result<Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(routes))
        .bind(listen)?
        .run();
    info!("web server listening on {listen}");
    Ok(server)
}

/// Route table, separated out so tests can mount it on a bare `App`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/stats").route(web::get().to(api_stats)))
        .service(web::resource("/api/client").route(web::get().to(api_client)))
        .service(web::resource("/api/meta").route(web::get().to(api_meta)))
        .service(web::resource("/api/reset").route(web::post().to(api_reset)))
        .service(web::resource("/api/client/reset").route(web::post().to(api_client_reset)))
        .service(
            web::resource("/api/client/reset_session")
                .route(web::post().to(api_client_reset_session)),
        )
        .service(web::resource("/metrics").route(web::get().to(metrics_page)))
        .service(web::resource("/static/{asset:.*}").route(web::get().to(static_asset)))
        .service(web::resource("/").route(web::get().to(clients_page)))
        .service(web::resource("/{mac}").route(web::get().to(client_page)));
}

#[derive(Serialize)]
struct StatsResponse {
    start_time: DateTime<Utc>,
    global: catchmole_stats::GlobalStats,
    clients: Vec<ClientStats>,
}

async fn api_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(StatsResponse {
        start_time: state.aggregator.start_time(),
        global: state.aggregator.global_stats(),
        clients: state.aggregator.clients(),
    })
}

#[derive(Deserialize)]
struct MacQuery {
    mac: Option<String>,
}

#[derive(Serialize)]
struct ClientResponse {
    client: Option<ClientStats>,
    flows: Vec<FlowDetail>,
    local_ips: Vec<String>,
}

async fn api_client(state: web::Data<AppState>, query: web::Query<MacQuery>) -> HttpResponse {
    let Some(mac) = normalize_mac(&query.mac) else {
        return HttpResponse::BadRequest().body("Missing mac parameter");
    };

    let view = state.aggregator.flows_by_mac(&mac);
    // The live per-flow count is fresher than the smoothed figure.
    let client = state.aggregator.client_with_session(&mac).map(|mut c| {
        c.active_connections = view.active_connections;
        c
    });

    HttpResponse::Ok().json(ClientResponse {
        client,
        flows: view.flows,
        local_ips: view.local_ips,
    })
}

async fn api_meta(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "ip_tools": state.ip_tools }))
}

async fn api_reset(state: web::Data<AppState>) -> HttpResponse {
    state.aggregator.reset();
    HttpResponse::Ok()
        .content_type("application/json")
        .body(r#"{"status":"ok"}"#)
}

async fn api_client_reset(state: web::Data<AppState>, query: web::Query<MacQuery>) -> HttpResponse {
    let mac = normalize_mac(&query.mac).unwrap_or_default();
    info!("api: reset client {mac}");
    state.aggregator.reset_client_by_mac(&mac);
    HttpResponse::Ok().body("OK")
}

async fn api_client_reset_session(
    state: web::Data<AppState>,
    query: web::Query<MacQuery>,
) -> HttpResponse {
    let mac = normalize_mac(&query.mac).unwrap_or_default();
    info!("api: reset session {mac}");
    state.aggregator.reset_session_by_mac(&mac);
    HttpResponse::Ok().body("OK")
}

async fn metrics_page(state: web::Data<AppState>) -> HttpResponse {
    let global = state.aggregator.global_stats();
    let clients = state.aggregator.clients();
    match state.metrics.render(&global, &clients) {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().body(format!("metrics error: {e}")),
    }
}

async fn clients_page() -> HttpResponse {
    HttpResponse::Ok().content_type("text/html").body(CLIENTS_PAGE)
}

async fn client_page() -> HttpResponse {
    HttpResponse::Ok().content_type("text/html").body(CLIENT_PAGE)
}

async fn static_asset(path: web::Path<String>) -> HttpResponse {
    match path.as_str() {
        "style.css" => HttpResponse::Ok().content_type("text/css").body(STYLESHEET),
        _ => HttpResponse::NotFound().finish(),
    }
}

fn normalize_mac(raw: &Option<String>) -> Option<String> {
    let mac = raw.as_deref()?.trim().to_lowercase();
    if mac.is_empty() {
        None
    } else {
        Some(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::time::Instant;

    use catchmole_core::events::{DeltaEvent, EventKind};
    use catchmole_core::lookup::NeighborLookup;

    const MAC_A: &str = "aa:aa:aa:aa:aa:aa";
    const IP_A: &str = "192.168.1.10";

    struct StaticLookup(HashMap<IpAddr, String>);

    impl NeighborLookup for StaticLookup {
        fn lookup(&self, ip: &IpAddr) -> Option<String> {
            self.0.get(ip).cloned()
        }
    }

    fn state_with_traffic() -> web::Data<AppState> {
        let mut map = HashMap::new();
        map.insert(IP_A.parse().unwrap(), MAC_A.to_string());
        let aggregator = Arc::new(Aggregator::new(Arc::new(StaticLookup(map))));

        aggregator.handle_event(DeltaEvent {
            src_ip: IP_A.parse().unwrap(),
            dst_ip: "8.8.8.8".parse().unwrap(),
            src_port: 50000,
            dst_port: 443,
            proto: 6,
            flow_id: 1,
            orig_delta: 1_000,
            reply_delta: 9_000,
            timestamp: Instant::now(),
            kind: EventKind::Update,
        });

        let mut ip_tools = BTreeMap::new();
        ip_tools.insert("ipinfo".to_string(), "https://ipinfo.io/{ip}".to_string());

        web::Data::new(AppState {
            aggregator,
            metrics: MetricsRecorder::new(),
            ip_tools,
        })
    }

    #[actix_web::test]
    async fn stats_returns_global_and_clients() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/api/stats").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert!(body["start_time"].is_string());
        assert_eq!(body["global"]["total_upload"], 1_000);
        assert_eq!(body["global"]["total_download"], 9_000);
        assert_eq!(body["clients"][0]["mac"], MAC_A);
    }

    #[actix_web::test]
    async fn client_requires_mac() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/api/client").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/client?mac=").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn client_view_overrides_active_connections() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        // MAC is trimmed and lower-cased before lookup.
        let uri = format!("/api/client?mac=%20{}%20", MAC_A.to_uppercase());
        let req = test::TestRequest::get().uri(&uri).to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["client"]["mac"], MAC_A);
        assert_eq!(body["client"]["active_connections"], 1);
        assert_eq!(body["flows"][0]["remote_ip"], "8.8.8.8");
        assert_eq!(body["local_ips"][0], IP_A);
    }

    #[actix_web::test]
    async fn unknown_client_returns_null_entry() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        let req = test::TestRequest::get()
            .uri("/api/client?mac=00:00:00:00:00:01")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["client"].is_null());
        assert_eq!(body["flows"].as_array().unwrap().len(), 0);
    }

    #[actix_web::test]
    async fn reset_requires_post() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/api/reset").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[actix_web::test]
    async fn reset_clears_statistics() {
        let state = state_with_traffic();
        let app =
            test::init_service(App::new().app_data(state.clone()).configure(routes)).await;

        let req = test::TestRequest::post().uri("/api/reset").to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, r#"{"status":"ok"}"#.as_bytes());

        assert!(state.aggregator.clients().is_empty());
        assert_eq!(state.aggregator.global_stats().total_upload, 0);
    }

    #[actix_web::test]
    async fn client_session_reset_keeps_totals() {
        let state = state_with_traffic();
        let app =
            test::init_service(App::new().app_data(state.clone()).configure(routes)).await;

        let uri = format!("/api/client/reset_session?mac={MAC_A}");
        let req = test::TestRequest::post().uri(&uri).to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, "OK".as_bytes());

        let client = state.aggregator.client_with_session(MAC_A).unwrap();
        assert_eq!(client.session_upload, 0);
        assert_eq!(client.total_upload, 1_000);
    }

    #[actix_web::test]
    async fn meta_lists_ip_tools() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/api/meta").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["ip_tools"]["ipinfo"], "https://ipinfo.io/{ip}");
    }

    #[actix_web::test]
    async fn metrics_exposes_prometheus_text() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("catchmole_global_upload_bytes_total 1000"));
        assert!(text.contains(MAC_A));
    }

    #[actix_web::test]
    async fn static_pages_and_assets() {
        let app =
            test::init_service(App::new().app_data(state_with_traffic()).configure(routes)).await;

        for uri in ["/", &format!("/{MAC_A}")] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK, "page {uri}");
        }

        let req = test::TestRequest::get().uri("/static/style.css").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/static/missing.js").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
