//! The agent surface (§6): no admin credential required, authenticated by
//! `public_key` for lookup-by-key endpoints.

use actix_web::{web, HttpRequest, HttpResponse};

use super::dto::*;
use super::error::HttpError;
use super::AppState;
use crate::nodes::RegisterRequest;
use crate::store::models::NodeStatus;
use crate::trust::HeartbeatMetrics;

fn peer_ip(req: &HttpRequest) -> Option<String> {
    req.connection_info().realip_remote_addr().map(|s| s.to_string())
}

pub async fn register(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<RegisterRequestDto>,
) -> Result<HttpResponse, HttpError> {
    let body = body.into_inner();
    let register_req = RegisterRequest {
        hostname: body.hostname,
        role: body.role,
        public_key: body.public_key,
        description: body.description,
        agent_version: body.agent_version,
        os_info: body.os_info,
        client_ip: peer_ip(&req),
    };
    let (node, is_new) = state.nodes.register(register_req).await?;
    let status = if is_new {
        actix_web::http::StatusCode::CREATED
    } else {
        actix_web::http::StatusCode::OK
    };
    Ok(HttpResponse::build(status).json(RegisterResponseDto::from(&node, is_new)))
}

async fn config_response(state: &AppState, node: crate::store::models::Node) -> Result<HttpResponse, HttpError> {
    if node.status != NodeStatus::Active {
        return Err(HttpError::Forbidden("NODE_NOT_ACTIVE"));
    }
    let config = state.policy.build_config_for_node(&node).await?;
    Ok(HttpResponse::Ok().json(NodeConfigResponseDto {
        peers: config.peers,
        acl_rules: config.acl_rules,
        config_version: config.config_version,
        generated_at: config.generated_at,
        dns_servers: state.config.dns_servers.clone(),
        heartbeat_interval_secs: state.config.heartbeat_interval_secs,
        config_sync_interval_secs: state.config.config_sync_interval_secs,
    }))
}

pub async fn config_by_public_key(
    state: web::Data<AppState>,
    query: web::Query<AgentConfigQuery>,
) -> Result<HttpResponse, HttpError> {
    let public_key = query.into_inner().public_key.ok_or(HttpError::NotFound("NODE_NOT_FOUND"))?;
    let node = state.nodes.get_by_public_key(&public_key).await?;
    config_response(&state, node).await
}

pub async fn config_by_hostname(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, HttpError> {
    let node = state.nodes.get_by_hostname(&path.into_inner()).await?;
    config_response(&state, node).await
}

pub async fn heartbeat(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<HeartbeatRequestDto>,
) -> Result<HttpResponse, HttpError> {
    let body = body.into_inner();
    let outcome = state
        .nodes
        .update_heartbeat(&body.public_key, peer_ip(&req), body.agent_version)
        .await?;

    let metrics = HeartbeatMetrics {
        cpu_percent: body.metrics.cpu_percent,
        memory_percent: body.metrics.memory_percent,
        disk_percent: body.metrics.disk_percent,
        security: body.metrics.security_events.map(Into::into).unwrap_or_default(),
        connections_total: body.metrics.connections_total,
        connections_time_wait: body.metrics.connections_time_wait,
    };

    let (node, trust_outcome) = state
        .trust
        .evaluate_heartbeat(outcome.node, outcome.previous_last_seen, metrics)
        .await;

    // `Node.config_version` is stamped once at registration and never
    // touched again; the live counter any policy mutation bumps (§4.3.2,
    // §9 Open Question a) lives on the store, not the node row.
    let current_config_version = state.store.current_config_version().await?;
    let config_changed = body
        .known_config_version
        .map(|known| known != current_config_version)
        .unwrap_or(false);

    Ok(HttpResponse::Ok().json(HeartbeatResponseDto {
        config_changed,
        current_config_version,
        trust_score: trust_outcome.score,
        risk_level: trust_outcome.risk_level,
        action_taken: trust_action_label(trust_outcome.action),
    }))
}

pub async fn status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, HttpError> {
    let node = state.nodes.get_by_hostname(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(NodeStatusResponseDto::from(&node)))
}
