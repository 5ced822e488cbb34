//! The client-device surface (§6): device enrollment is admin-gated, config
//! retrieval is gated by possession of the one-time `config_token` instead.

use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;

use super::dto::*;
use super::error::HttpError;
use super::{require_admin, AppState};
use crate::clients::CreateDeviceRequest;

pub async fn create_device(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateDeviceRequestDto>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let body = body.into_inner();
    let (device, _private_key, config_token) = state
        .clients
        .create_device(CreateDeviceRequest {
            device_name: body.device_name,
            device_type: body.device_type,
            user_id: body.user_id,
            tunnel_mode: body.tunnel_mode,
        })
        .await?;
    Ok(HttpResponse::Created().json(CreateDeviceResponseDto {
        device_id: device.id,
        overlay_ip: device.overlay_ip,
        config_token,
        expires_at: device.expires_at,
    }))
}

pub async fn revoke_device(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, HttpError> {
    require_admin(&req, &state)?;
    let device = state.clients.revoke_device(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(DeviceResponseDto::from(&device)))
}

/// One-time JSON retrieval: `config_token` is consumed by the store on first
/// successful fetch (§3 ClientDevice invariants), so this never needs an
/// admin header — the token itself is the credential. `qr_code_base64` stays
/// `None`; no QR-code rendering crate is wired into this dependency stack.
pub async fn fetch_config(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, HttpError> {
    let config = state.clients.fetch_config(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ClientConfigResponseDto {
        wireguard_config: config.wireguard_config,
        qr_code_base64: None,
        device_id: config.device.id,
        expires_at: config.device.expires_at,
    }))
}

pub async fn fetch_config_raw(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, HttpError> {
    let config = state.clients.fetch_config(&path.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}.conf\"", config.device.device_name),
        ))
        .body(config.wireguard_config))
}
