//! The admin surface (§6): every handler starts by checking `X-Admin-Token`.

use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;

use super::dto::*;
use super::error::HttpError;
use super::{require_admin, AppState};
use crate::ipam::{stats, Pool};
use crate::store::NewAccessPolicy;

pub async fn list_nodes(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let nodes = state.nodes.list_all().await?;
    let dtos: Vec<NodeResponseDto> = nodes.iter().map(NodeResponseDto::from).collect();
    Ok(HttpResponse::Ok().json(dtos))
}

pub async fn get_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let node = state.nodes.get_by_id(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(NodeResponseDto::from(&node)))
}

pub async fn approve_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let node = state.nodes.approve(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(NodeResponseDto::from(&node)))
}

pub async fn suspend_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<SuspendRequestDto>>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let reason = body.map(|b| b.into_inner().reason).unwrap_or_else(default_suspend_reason);
    let node = state.nodes.suspend(path.into_inner(), &reason).await?;
    Ok(HttpResponse::Ok().json(NodeResponseDto::from(&node)))
}

pub async fn revoke_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<SuspendRequestDto>>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let reason = body.map(|b| b.into_inner().reason).unwrap_or_else(default_suspend_reason);
    let node = state.nodes.revoke(path.into_inner(), &reason).await?;
    Ok(HttpResponse::Ok().json(NodeResponseDto::from(&node)))
}

fn default_suspend_reason() -> String {
    "admin action".to_string()
}

pub async fn delete_node(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    state.nodes.delete(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn list_policies(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let policies = state.store.list_all_policies_sorted().await?;
    let dtos: Vec<PolicyResponseDto> = policies.iter().map(PolicyResponseDto::from).collect();
    Ok(HttpResponse::Ok().json(dtos))
}

pub async fn get_policy(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let policy = state.policy.get_policy(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(PolicyResponseDto::from(&policy)))
}

pub async fn create_policy(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreatePolicyRequestDto>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let body = body.into_inner();
    let policy = state
        .policy
        .create_policy(NewAccessPolicy {
            name: body.name,
            src_role: body.src_role,
            dst_role: body.dst_role,
            port: body.port,
            protocol: body.protocol,
            action: body.action,
            priority: body.priority,
            enabled: body.enabled,
        })
        .await?;
    Ok(HttpResponse::Created().json(PolicyResponseDto::from(&policy)))
}

pub async fn update_policy(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<CreatePolicyRequestDto>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let body = body.into_inner();
    let policy = state
        .policy
        .update_policy(crate::store::models::AccessPolicy {
            id: path.into_inner(),
            name: body.name,
            src_role: body.src_role,
            dst_role: body.dst_role,
            port: body.port,
            protocol: body.protocol,
            action: body.action,
            priority: body.priority,
            enabled: body.enabled,
        })
        .await?;
    Ok(HttpResponse::Ok().json(PolicyResponseDto::from(&policy)))
}

pub async fn delete_policy(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    state.policy.delete_policy(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

fn node_pool(state: &AppState) -> Pool {
    Pool::node_pool(state.config.overlay_network, state.config.overlay_gateway)
}

fn client_pool(state: &AppState) -> Pool {
    Pool::client_pool(
        state.config.overlay_network,
        state.config.overlay_gateway,
        state.config.client_ip_pool_start,
        state.config.client_ip_pool_end,
    )
}

pub async fn network_stats(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let node_pool = node_pool(&state);
    let client_pool = client_pool(&state);
    let taken_nodes = state.store.taken_addresses(&node_pool).await?;
    let taken_clients = state.store.taken_addresses(&client_pool).await?;
    Ok(HttpResponse::Ok().json(NetworkStatsResponseDto {
        node_pool: stats(&node_pool, &taken_nodes),
        client_pool: stats(&client_pool, &taken_clients),
    }))
}

pub async fn network_allocations(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let nodes = state.nodes.list_all().await?;
    let mut allocations: Vec<AllocationDto> = nodes
        .iter()
        .filter_map(|n| {
            n.overlay_ip.map(|net| AllocationDto {
                ip_address: net.addr(),
                kind: "node",
                owner_id: n.id,
                owner_name: n.hostname.clone(),
            })
        })
        .collect();

    let node_pool = node_pool(&state);
    let taken_nodes = state.store.taken_addresses(&node_pool).await?;
    // Node and client-device allocation both draw from the union of
    // `nodes.overlay_ip` and `client_devices.overlay_ip` (§4.1, I1), so the
    // two sets below are disjoint; the `taken_nodes` exclusion here just
    // guards against listing an address twice, not against a real collision.
    let client_pool = client_pool(&state);
    let taken_clients = state.store.taken_addresses(&client_pool).await?;
    for addr in taken_clients {
        if taken_nodes.contains(&addr) {
            continue;
        }
        allocations.push(AllocationDto {
            ip_address: addr,
            kind: "client_device",
            owner_id: Uuid::nil(),
            owner_name: String::new(),
        });
    }

    Ok(HttpResponse::Ok().json(allocations))
}
