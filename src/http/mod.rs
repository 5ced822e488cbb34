//! The `/api/v1` HTTP surface (§6), grounded on the teacher's
//! `agent_control::http_server` module: a typed `AppState` handed to every
//! handler through `web::Data`, one submodule per surface (agent, admin,
//! client), and errors mapped through `ResponseError` rather than matched in
//! every handler.

pub mod admin;
pub mod agent;
pub mod client;
pub mod dto;
pub mod error;

use std::sync::Arc;

use actix_web::{web, HttpRequest};

pub use error::HttpError;

use crate::clients::ClientManager;
use crate::config::ControllerConfig;
use crate::nodes::NodeManager;
use crate::overlay::OverlayDriver;
use crate::policy::access::UserDirectory;
use crate::policy::PolicyEngine;
use crate::store::Store;
use crate::trust::TrustEngine;

pub struct AppState {
    pub config: ControllerConfig,
    pub store: Arc<dyn Store>,
    pub overlay: Arc<dyn OverlayDriver>,
    pub nodes: NodeManager,
    pub policy: PolicyEngine,
    pub trust: TrustEngine,
    pub clients: ClientManager,
    pub directory: UserDirectory,
}

/// Constant-time comparison so a mistyped admin token doesn't leak timing
/// information about how many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// §6 admin surface: `X-Admin-Token` must equal `ADMIN_SECRET`, else 401.
/// Called at the top of every admin/client-management handler rather than as
/// middleware, so the 401 path is exercised by the same unit tests as the
/// handler logic.
pub fn require_admin(req: &HttpRequest, state: &AppState) -> Result<(), HttpError> {
    let token = req
        .headers()
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if constant_time_eq(token.as_bytes(), state.config.admin_secret.as_bytes()) {
        Ok(())
    } else {
        Err(HttpError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientManager;
    use crate::ipam::Pool;
    use crate::overlay::memory::InMemoryOverlayDriver;
    use crate::store::memory::InMemoryStore;
    use actix_web::{test, App};
    use serde_json::{json, Value};

    const ADMIN_SECRET: &str = "s3cret-admin-token";

    fn test_state() -> web::Data<AppState> {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let overlay: Arc<dyn OverlayDriver> = Arc::new(InMemoryOverlayDriver::new());
        let events = crate::events::EventBus::default();

        let network: ipnet::Ipv4Net = "10.0.0.0/24".parse().unwrap();
        let gateway: std::net::Ipv4Addr = "10.0.0.1".parse().unwrap();
        let node_pool = Pool::node_pool(network, gateway);
        let client_pool = Pool::client_pool(network, gateway, 200, 210);

        let config = ControllerConfig {
            overlay_network: network,
            overlay_gateway: gateway,
            hub_public_key: "HUBPUBKEY==".to_string(),
            hub_endpoint: Some("hub.example.com:51820".to_string()),
            dns_servers: vec!["1.1.1.1".parse().unwrap()],
            client_ip_pool_start: 200,
            client_ip_pool_end: 210,
            client_max_devices_per_user: 5,
            client_default_expires_days: 90,
            client_require_admin_approval: false,
            auto_approve_all: true,
            auto_approve_roles: Default::default(),
            heartbeat_interval_secs: 30,
            config_sync_interval_secs: 60,
            node_timeout_minutes: 10,
            admin_secret: ADMIN_SECRET.to_string(),
            database_url: "postgres://localhost/test".to_string(),
            bind_address: "0.0.0.0:0".to_string(),
        };

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
            config.hub_endpoint.clone().unwrap_or_default(),
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
            config.hub_endpoint.clone().unwrap_or_default(),
            config.dns_servers.iter().map(|ip| ip.to_string()).collect(),
        );
        let directory = UserDirectory::new(store.clone());

        web::Data::new(AppState {
            config,
            store,
            overlay,
            nodes,
            policy,
            trust,
            clients,
            directory,
        })
    }

    #[actix_web::test]
    async fn scenario_s1_register_then_reregister_is_idempotent() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K1=="}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["is_new"], true);
        assert_eq!(body["overlay_ip"], "10.0.0.2/24");
        let node_id = body["node_id"].clone();

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K1=="}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["is_new"], false);
        assert_eq!(body["node_id"], node_id);
        assert_eq!(body["overlay_ip"], "10.0.0.2/24");
    }

    #[actix_web::test]
    async fn register_with_reused_hostname_and_different_key_is_a_conflict() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K1=="}))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K2=="}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 409);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "HOSTNAME_EXISTS");
    }

    #[actix_web::test]
    async fn admin_routes_require_the_admin_token() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::get().uri("/api/v1/admin/nodes").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);

        let req = test::TestRequest::get()
            .uri("/api/v1/admin/nodes")
            .insert_header(("X-Admin-Token", "wrong"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 401);

        let req = test::TestRequest::get()
            .uri("/api/v1/admin/nodes")
            .insert_header(("X-Admin-Token", ADMIN_SECRET))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
    }

    #[actix_web::test]
    async fn scenario_s2_acl_compilation_via_heartbeat_config_fetch() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        for (hostname, role, key) in [("app-01", "app", "K1=="), ("db-01", "db", "K2==")] {
            let req = test::TestRequest::post()
                .uri("/api/v1/agent/register")
                .set_json(json!({"hostname": hostname, "role": role, "public_key": key}))
                .to_request();
            test::call_service(&app, req).await;
        }

        let req = test::TestRequest::post()
            .uri("/api/v1/admin/policies")
            .insert_header(("X-Admin-Token", ADMIN_SECRET))
            .set_json(json!({
                "name": "app->db",
                "src_role": "app",
                "dst_role": "db",
                "port": 5432,
                "protocol": "tcp",
                "action": "ACCEPT"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);

        let req = test::TestRequest::get().uri("/api/v1/agent/config/db-01").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        let rules = body["acl_rules"].as_array().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["src_ip"], "10.0.0.2");
        assert_eq!(rules[0]["port"], 5432);

        let req = test::TestRequest::get().uri("/api/v1/agent/config/app-01").to_request();
        let resp = test::call_service(&app, req).await;
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["acl_rules"].as_array().unwrap().len(), 0);
    }

    #[actix_web::test]
    async fn duplicate_policy_name_is_rejected() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let make_req = || {
            test::TestRequest::post()
                .uri("/api/v1/admin/policies")
                .insert_header(("X-Admin-Token", ADMIN_SECRET))
                .set_json(json!({
                    "name": "dup",
                    "src_role": "app",
                    "dst_role": "db",
                    "port": 5432,
                    "protocol": "tcp",
                    "action": "ACCEPT"
                }))
                .to_request()
        };
        let resp = test::call_service(&app, make_req()).await;
        assert_eq!(resp.status(), 201);
        let resp = test::call_service(&app, make_req()).await;
        assert_eq!(resp.status(), 409);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "POLICY_EXISTS");
    }

    #[actix_web::test]
    async fn invalid_port_is_rejected_with_400() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/admin/policies")
            .insert_header(("X-Admin-Token", ADMIN_SECRET))
            .set_json(json!({
                "name": "bad-port",
                "src_role": "app",
                "dst_role": "db",
                "port": 0,
                "protocol": "tcp",
                "action": "ACCEPT"
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "INVALID_POLICY");
    }

    #[actix_web::test]
    async fn scenario_s3_heartbeat_returns_trust_score_and_no_action() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K1=="}))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/heartbeat")
            .set_json(json!({
                "public_key": "K1==",
                "metrics": {
                    "cpu_percent": 50.0,
                    "memory_percent": 50.0,
                    "disk_percent": 50.0,
                    "connections_total": 10,
                    "connections_time_wait": 0,
                    "security_events": {"risk_level": "low", "risk_factors": []}
                }
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert!((body["trust_score"].as_f64().unwrap() - 0.92).abs() < 1e-9);
        assert!(body["action_taken"].is_null());
    }

    #[actix_web::test]
    async fn heartbeat_for_unknown_node_is_404() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/heartbeat")
            .set_json(json!({"public_key": "ghost", "metrics": {}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn config_for_pending_node_is_forbidden() {
        let state = test_state();
        let mut config = state.config.clone();
        config.auto_approve_all = false;

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let overlay: Arc<dyn OverlayDriver> = Arc::new(InMemoryOverlayDriver::new());
        let events = crate::events::EventBus::default();
        let node_pool = Pool::node_pool(config.overlay_network, config.overlay_gateway);
        let client_pool = Pool::client_pool(
            config.overlay_network,
            config.overlay_gateway,
            config.client_ip_pool_start,
            config.client_ip_pool_end,
        );
        let nodes = NodeManager::new(
            store.clone(),
            overlay.clone(),
            events.clone(),
            node_pool,
            false,
            Default::default(),
        );
        let policy = PolicyEngine::new(
            store.clone(),
            events.clone(),
            config.hub_public_key.clone(),
            config.hub_endpoint.clone().unwrap_or_default(),
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
            config.hub_endpoint.clone().unwrap_or_default(),
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

        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K1=="}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);

        let req = test::TestRequest::get().uri("/api/v1/agent/config/app-01").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 403);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "NODE_NOT_ACTIVE");
    }

    #[actix_web::test]
    async fn client_device_lifecycle_create_fetch_revoke() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/client/devices")
            .insert_header(("X-Admin-Token", ADMIN_SECRET))
            .set_json(json!({"device_name": "laptop", "device_type": "laptop", "user_id": "alice"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
        let body: Value = test::read_body_json(resp).await;
        let token = body["config_token"].as_str().unwrap().to_string();
        let device_id = body["device_id"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/client/config/{token}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["wireguard_config"].as_str().unwrap().contains("[Interface]"));

        // The token is consumed on first fetch (§3 ClientDevice invariant).
        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/client/config/{token}"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/v1/client/devices/{device_id}"))
            .insert_header(("X-Admin-Token", ADMIN_SECRET))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "revoked");
    }

    #[actix_web::test]
    async fn network_stats_reflects_allocations() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/agent/register")
            .set_json(json!({"hostname": "app-01", "role": "app", "public_key": "K1=="}))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get()
            .uri("/api/v1/admin/network/stats")
            .insert_header(("X-Admin-Token", ADMIN_SECRET))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["node_pool"]["used"], 1);
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::scope("/agent")
                    .route("/register", web::post().to(agent::register))
                    .route("/config", web::get().to(agent::config_by_public_key))
                    .route("/config/{hostname}", web::get().to(agent::config_by_hostname))
                    .route("/heartbeat", web::post().to(agent::heartbeat))
                    .route("/status/{hostname}", web::get().to(agent::status)),
            )
            .service(
                web::scope("/admin")
                    .route("/nodes", web::get().to(admin::list_nodes))
                    .route("/nodes/{id}", web::get().to(admin::get_node))
                    .route("/nodes/{id}", web::delete().to(admin::delete_node))
                    .route("/nodes/{id}/approve", web::post().to(admin::approve_node))
                    .route("/nodes/{id}/suspend", web::post().to(admin::suspend_node))
                    .route("/nodes/{id}/revoke", web::post().to(admin::revoke_node))
                    .route("/policies", web::get().to(admin::list_policies))
                    .route("/policies", web::post().to(admin::create_policy))
                    .route("/policies/{id}", web::get().to(admin::get_policy))
                    .route("/policies/{id}", web::put().to(admin::update_policy))
                    .route("/policies/{id}", web::delete().to(admin::delete_policy))
                    .route("/network/stats", web::get().to(admin::network_stats))
                    .route("/network/allocations", web::get().to(admin::network_allocations)),
            )
            .service(
                web::scope("/client")
                    .route("/devices", web::post().to(client::create_device))
                    .route("/devices/{id}", web::delete().to(client::revoke_device))
                    .route("/config/{token}", web::get().to(client::fetch_config))
                    .route("/config/{token}/raw", web::get().to(client::fetch_config_raw)),
            ),
    );
}
