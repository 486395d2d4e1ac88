//! RPC method handlers over the messaging service.

use std::sync::Arc;

use serde::Deserialize;

use herald_core::ids::InstanceId;
use herald_core::rate_limit::RateLimitUpdate;
use herald_dispatch::{MessagingService, SendRequest};
use herald_settings::NotificationSettings;

use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub service: Arc<MessagingService>,
}

impl HandlerState {
    pub fn new(service: Arc<MessagingService>) -> Self {
        Self { service }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterParams {
    phone_number: String,
    #[serde(default)]
    display_name: String,
}

/// Dispatch an RPC method to the appropriate handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Instances
        "instance.register" => instance_register(state, params, id),
        "instance.list" => instance_list(state, id),
        "instance.initialize" => instance_initialize(state, params, id).await,
        "instance.status" => instance_status(state, params, id),
        "instance.qr" => instance_qr(state, params, id),

        // Messages
        "message.send" => message_send(state, params, id).await,

        // Dispatch settings
        "rateLimit.get" => RpcResponse::from_serialize(id, &state.service.rate_limit()),
        "rateLimit.set" => rate_limit_set(state, params, id),
        "notifications.get" => {
            RpcResponse::from_serialize(id, &state.service.notification_settings())
        }
        "notifications.set" => notifications_set(state, params, id),

        // System
        "system.ping" => RpcResponse::success(id, serde_json::json!({"pong": true})),
        "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn instance_id_param(params: &serde_json::Value) -> Result<InstanceId, String> {
    rpc::require_str(params, "instanceId").map(InstanceId::from_raw)
}

fn instance_register(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params: RegisterParams = match rpc::parse_params(params) {
        Ok(p) => p,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state
        .service
        .register_instance(&params.phone_number, &params.display_name)
    {
        Ok(instance) => RpcResponse::from_serialize(id, &instance),
        Err(e) => RpcResponse::service_error(id, &e),
    }
}

fn instance_list(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let instances = state.service.list_instances();
    match serde_json::to_value(&instances) {
        Ok(list) => RpcResponse::success(id, serde_json::json!({ "instances": list })),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

async fn instance_initialize(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let instance_id = match instance_id_param(params) {
        Ok(i) => i,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.initialize_instance(&instance_id).await {
        Ok(status) => RpcResponse::from_serialize(id, &status),
        Err(e) => RpcResponse::service_error(id, &e),
    }
}

fn instance_status(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let instance_id = match instance_id_param(params) {
        Ok(i) => i,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.instance_status(&instance_id) {
        Ok(status) => RpcResponse::from_serialize(id, &status),
        Err(e) => RpcResponse::service_error(id, &e),
    }
}

fn instance_qr(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let instance_id = match instance_id_param(params) {
        Ok(i) => i,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.qr_code(&instance_id) {
        Ok(qr) => RpcResponse::success(
            id,
            serde_json::json!({ "instanceId": instance_id, "qrCode": qr }),
        ),
        Err(e) => RpcResponse::service_error(id, &e),
    }
}

/// Resolves once the message is sent, fails, or is stored for later.
async fn message_send(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let request: SendRequest = match rpc::parse_params(params) {
        Ok(r) => r,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.service.send_message(request).await {
        Ok(record) => RpcResponse::from_serialize(id, &record),
        Err(e) => RpcResponse::service_error(id, &e),
    }
}

fn rate_limit_set(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let update: RateLimitUpdate = match rpc::parse_params(params) {
        Ok(u) => u,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    RpcResponse::from_serialize(id, &state.service.set_rate_limit(&update))
}

/// Replaces the notification settings wholesale; omitted fields reset to defaults.
fn notifications_set(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let settings: NotificationSettings = match rpc::parse_params(params) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    state.service.set_notification_settings(settings);
    RpcResponse::from_serialize(id, &state.service.notification_settings())
}

pub(crate) fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "instances": state.service.list_instances().len(),
            "queueDepth": state.service.queue_depth(),
        }),
    )
}
