//! The local RPC bridge: external task processes call back into the
//! robot by POSTing JSON to a localhost-only endpoint, identified by
//! the task ID handed to them in their environment. One route, one
//! envelope, function dispatch on `FuncName`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::connector::MessageFormat;
use crate::pipeline::Services;
use crate::protocol::{RetVal, decode_payload};
use crate::replies::ReplyOutcome;
use crate::tasks::Task;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(rename = "FuncName")]
    func_name: String,
    #[serde(rename = "User", default)]
    user: String,
    #[serde(rename = "Channel", default)]
    channel: String,
    #[serde(rename = "Format", default)]
    format: String,
    #[serde(rename = "PluginID", default)]
    plugin_id: String,
    #[serde(rename = "FuncArgs", default)]
    func_args: Value,
}

pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/json", post(handle_rpc))
        .with_state(services)
}

/// Bind the bridge on loopback and serve until shutdown. External
/// tasks find the URL in COGBOT_HTTP_POST.
pub async fn serve(services: Arc<Services>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!("plugin bridge listening on 127.0.0.1:{port}");
    axum::serve(listener, router(services)).await?;
    Ok(())
}

fn arg_str(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn arg_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn arg_u64(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn ret(rv: RetVal) -> Json<Value> {
    Json(json!({ "RetVal": rv }))
}

async fn handle_rpc(
    State(services): State<Arc<Services>>,
    Json(req): Json<RpcRequest>,
) -> Json<Value> {
    debug!("bridge call '{}' from task {}", req.func_name, req.plugin_id);
    let args = &req.func_args;
    let format = MessageFormat::parse(&req.format);
    let channel = (!req.channel.is_empty()).then_some(req.channel.as_str());

    // The caller's task, for namespacing and configuration access.
    let caller = services.registry.current().task_by_id(&req.plugin_id);

    match req.func_name.as_str() {
        "CheckAdmin" => Json(json!({
            "Boolean": services.is_admin(&req.user),
            "RetVal": RetVal::Ok,
        })),

        "Elevate" => {
            let immediate = arg_bool(args, "Immediate");
            let elevated = match &services.elevator {
                Some(elevator) => elevator.elevate(&req.user, immediate).await,
                None => {
                    warn!("Elevate called with no elevator configured");
                    false
                }
            };
            Json(json!({ "Boolean": elevated, "RetVal": RetVal::Ok }))
        }

        "CheckoutDatum" => {
            let Some(key) = caller_key(&caller, &arg_str(args, "Key")) else {
                return checkout_failed(RetVal::InvalidDatumKey);
            };
            let co = services.brain.checkout(&key, arg_bool(args, "RW")).await;
            if co.ret != RetVal::Ok {
                return checkout_failed(co.ret);
            }
            let datum: Value = co
                .payload
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(Value::Null);
            Json(json!({
                "LockToken": co.token,
                "Exists": co.exists,
                "Datum": datum,
                "RetVal": RetVal::Ok,
            }))
        }

        "CheckinDatum" => {
            let Some(key) = caller_key(&caller, &arg_str(args, "Key")) else {
                return ret(RetVal::InvalidDatumKey);
            };
            ret(services.brain.checkin(&key, &arg_str(args, "Token")))
        }

        "UpdateDatum" => {
            let Some(key) = caller_key(&caller, &arg_str(args, "Key")) else {
                return ret(RetVal::InvalidDatumKey);
            };
            let datum = args.get("Datum").cloned().unwrap_or(Value::Null);
            let payload = match serde_json::to_string(&datum) {
                Ok(p) => p,
                Err(_) => return ret(RetVal::DataFormatError),
            };
            ret(services.brain.update(&key, &arg_str(args, "Token"), &payload))
        }

        "GetPluginConfig" => {
            let config = caller
                .as_ref()
                .and_then(|t| t.as_plugin())
                .and_then(|p| p.raw_config.clone());
            match config {
                Some(config) => Json(json!({ "Config": config, "RetVal": RetVal::Ok })),
                None => Json(json!({ "Config": null, "RetVal": RetVal::NoConfigFound })),
            }
        }

        "GetSenderAttribute" | "GetUserAttribute" => {
            let user = if req.func_name == "GetSenderAttribute" {
                req.user.clone()
            } else {
                arg_str(args, "User")
            };
            let attribute = arg_str(args, "Attribute");
            match services.connector.user_attribute(&user, &attribute).await {
                Some(value) => {
                    Json(json!({ "Attribute": value, "RetVal": RetVal::Ok }))
                }
                None => Json(json!({ "Attribute": "", "RetVal": RetVal::AttributeNotFound })),
            }
        }

        "GetBotAttribute" => {
            let attribute = arg_str(args, "Attribute");
            match attribute.as_str() {
                "name" => Json(json!({ "Attribute": services.bot_name, "RetVal": RetVal::Ok })),
                _ => Json(json!({ "Attribute": "", "RetVal": RetVal::AttributeNotFound })),
            }
        }

        "Log" => {
            let message = decode_payload(&arg_str(args, "Message")).unwrap_or_default();
            let task = caller
                .as_ref()
                .map(|t| t.core().name.clone())
                .unwrap_or_else(|| "unknown".to_string());
            match arg_str(args, "Level").to_ascii_lowercase().as_str() {
                "error" | "fatal" => error!("task {task}: {message}"),
                "warn" => warn!("task {task}: {message}"),
                "debug" | "trace" => debug!("task {task}: {message}"),
                _ => info!("task {task}: {message}"),
            }
            ret(RetVal::Ok)
        }

        "SendChannelMessage" => {
            let Some(message) = decode_payload(&arg_str(args, "Message")) else {
                return ret(RetVal::DataFormatError);
            };
            ret(services
                .connector
                .send_channel_message(&arg_str(args, "Channel"), &message, format)
                .await)
        }

        "SendUserMessage" => {
            let Some(message) = decode_payload(&arg_str(args, "Message")) else {
                return ret(RetVal::DataFormatError);
            };
            ret(services
                .connector
                .send_user_message(&arg_str(args, "User"), &message, format)
                .await)
        }

        "SendUserChannelMessage" => {
            let Some(message) = decode_payload(&arg_str(args, "Message")) else {
                return ret(RetVal::DataFormatError);
            };
            ret(services
                .connector
                .send_user_channel_message(
                    &arg_str(args, "User"),
                    &arg_str(args, "Channel"),
                    &message,
                    format,
                )
                .await)
        }

        "WaitForReply" => {
            let label = arg_str(args, "RegexID");
            let pattern = caller
                .as_ref()
                .and_then(|t| t.as_plugin())
                .and_then(|p| p.reply_matcher(&label))
                .map(|m| m.regex.clone());
            let Some(pattern) = pattern else {
                return Json(json!({ "Reply": "", "RetVal": RetVal::MatcherNotFound }));
            };
            wait_reply(&services, &req.user, channel, &pattern, args).await
        }

        "WaitForReplyRegex" => {
            let pattern = arg_str(args, "RegEx");
            wait_reply(&services, &req.user, channel, &pattern, args).await
        }

        other => {
            error!("unknown bridge function '{other}'");
            ret(RetVal::GeneralError)
        }
    }
}

fn caller_key(caller: &Option<Arc<Task>>, key: &str) -> Option<String> {
    let task = caller.as_ref()?;
    if key.is_empty() {
        return None;
    }
    Some(format!("{}:{}", task.core().namespace, key))
}

fn checkout_failed(rv: RetVal) -> Json<Value> {
    Json(json!({
        "LockToken": "",
        "Exists": false,
        "Datum": null,
        "RetVal": rv,
    }))
}

async fn wait_reply(
    services: &Services,
    user: &str,
    channel: Option<&str>,
    pattern: &str,
    args: &Value,
) -> Json<Value> {
    let timeout = Duration::from_secs(arg_u64(args, "Timeout", 45));
    match services
        .replies
        .wait_for_reply(user, channel, pattern, timeout)
        .await
    {
        Ok(ReplyOutcome::Matched(text)) => {
            Json(json!({ "Reply": text, "RetVal": RetVal::Ok }))
        }
        Ok(ReplyOutcome::NotMatched(text)) => {
            Json(json!({ "Reply": text, "RetVal": RetVal::ReplyNotMatched }))
        }
        Ok(ReplyOutcome::TimedOut) => {
            Json(json!({ "Reply": "", "RetVal": RetVal::TimeoutExpired }))
        }
        Err(e) => {
            error!("bad reply pattern '{pattern}': {e}");
            Json(json!({ "Reply": "", "RetVal": RetVal::MatcherNotFound }))
        }
    }
}
