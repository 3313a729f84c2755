//! Connection-accept loops for the daemon's external TCP surfaces (spec
//! §2, §5): the Asset Manager's client port and the Resource Manager's
//! provider-registration port. Each accepted connection is validated at
//! the wire-level version gate, then handed to a per-role handler —
//! mirrors the teacher's split between a transport-level listener and a
//! business-level dispatcher, kept deliberately thin since fusion-wire
//! already owns framing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fusion_core::error::Result;
use fusion_core::ids::VerRef;
use fusion_wire::{validate_protocol_version, Message, MessageKind, WireChannel, WireListener};
use tracing::{info, warn};

use crate::assets::manager::AssetManager;
use crate::assets::model::VersionState;
use crate::lifecycle::ExitFlag;
use crate::protocol::{
    asset_manager_commands as am_cmd, resource_manager_commands as rm_cmd, BuildReply,
    BuildRequest, GetCurrTasksReply, PlainTextReply, ProductReImportReply, ProductReImportRequest,
    ProviderConnectNotify, VerrefRequest,
};
use crate::resources::manager::ResourceManager;

/// Shared context every Asset Manager client connection dispatches
/// against.
pub struct AssetServerContext {
    pub manager: Arc<AssetManager>,
    pub config_dir: std::path::PathBuf,
    pub task_rules: Arc<fusion_core::config::TaskRuleStore>,
    pub mutex_timed_wait: Duration,
}

/// Accepts Asset Manager client connections. Every connection opens with
/// the wire-level version gate (spec §4.1); once past it, the same
/// connection either `Register`s as an `AssetChanges` listener or issues
/// ordinary `Request`/`Reply` traffic for its whole lifetime.
pub async fn run_asset_manager_listener(
    listener: WireListener,
    ctx: Arc<AssetServerContext>,
    exit_flag: ExitFlag,
) {
    loop {
        let (channel, peer) = tokio::select! {
            _ = exit_flag.cancelled() => {
                info!("asset manager listener stopping: shutdown requested");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "asset manager accept failed");
                    continue;
                }
            },
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let channel = Arc::new(channel);
            if let Err(err) = validate_protocol_version(&channel, crate::FUSION_VERSION).await {
                warn!(%peer, error = %err, "asset manager connection rejected at the version gate");
                return;
            }
            run_asset_connection(channel, ctx).await;
        });
    }
}

/// Services one already-version-gated Asset Manager connection. `Register`
/// hands the connection off to the change-broadcast listener for its
/// remaining lifetime (spec §4.2 "Register surface"); `Request` is
/// answered in place; anything else is ignored.
async fn run_asset_connection(channel: Arc<WireChannel>, ctx: Arc<AssetServerContext>) {
    loop {
        let message = match channel.recv().await {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "asset client connection read failed");
                return;
            }
        };
        match message.kind {
            MessageKind::Register if message.command.as_str() == am_cmd::ASSET_CHANGES_REGISTER => {
                let reply = Message::reply(message.serial, message.command.clone(), Bytes::new());
                if let Err(err) = channel.send(&reply).await {
                    warn!(error = %err, "failed to ack AssetChanges registration");
                    return;
                }
                run_asset_changes_listener(channel, ctx).await;
                return;
            }
            MessageKind::Request => {
                let response = match dispatch_asset_request(&ctx, &message).await {
                    Ok(payload) => Message::reply(message.serial, message.command.clone(), payload),
                    Err(err) => Message::exception(
                        message.serial,
                        message.command.clone(),
                        &err.as_exception_payload(),
                    ),
                };
                if let Err(err) = channel.send(&response).await {
                    warn!(error = %err, "failed to reply to asset client");
                    return;
                }
            }
            _ => continue,
        }
    }
}

async fn run_asset_changes_listener(channel: Arc<WireChannel>, ctx: Arc<AssetServerContext>) {
    let id = ctx.manager.notifier().register(channel.clone());
    info!(listener = id, "asset change listener registered");
    loop {
        match channel.recv().await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    ctx.manager.notifier().unregister(id);
}

async fn dispatch_asset_request(ctx: &AssetServerContext, message: &Message) -> Result<Bytes> {
    use fusion_core::error::FusionError;

    let command = message.command.as_str();
    match command {
        // The real gate runs once per connection, before this dispatcher
        // ever sees a message (`fusion_wire::validate_protocol_version`).
        // A client is free to ask again mid-session; answer from the same
        // version string rather than rejecting it.
        am_cmd::VALIDATE_PROTOCOL_VERSION => {
            let reply = PlainTextReply {
                text: crate::FUSION_VERSION.to_owned(),
            };
            Ok(Bytes::from(serde_json::to_vec(&reply).map_err(|e| FusionError::client_request(command, e.to_string()))?))
        }
        am_cmd::BUILD => {
            let req: BuildRequest = serde_json::from_slice(&message.payload)
                .map_err(|e| FusionError::client_request(command, e.to_string()))?;
            let reply: BuildReply = ctx.manager.build(&req.asset).await?;
            Ok(Bytes::from(serde_json::to_vec(&reply).map_err(|e| FusionError::client_request(command, e.to_string()))?))
        }
        am_cmd::CANCEL_VERSION => run_transition(ctx, command, message, VersionState::Canceled).await,
        am_cmd::REBUILD_VERSION => run_transition(ctx, command, message, VersionState::Queued).await,
        am_cmd::SET_BAD_VERSION => run_transition(ctx, command, message, VersionState::Bad).await,
        am_cmd::CLEAR_BAD_VERSION => run_transition(ctx, command, message, VersionState::Waiting).await,
        am_cmd::CLEAN_VERSION => run_transition(ctx, command, message, VersionState::Cleaned).await,
        am_cmd::PRODUCT_REIMPORT => {
            let req: ProductReImportRequest = serde_json::from_slice(&message.payload)
                .map_err(|e| FusionError::client_request(command, e.to_string()))?;
            let reply: ProductReImportReply = ctx.manager.product_reimport(&req.asset, |_asset| false).await?;
            Ok(Bytes::from(serde_json::to_vec(&reply).map_err(|e| FusionError::client_request(command, e.to_string()))?))
        }
        am_cmd::GET_CURR_TASKS => {
            let reply: GetCurrTasksReply = ctx.manager.get_curr_tasks(ctx.mutex_timed_wait).await;
            Ok(Bytes::from(serde_json::to_vec(&reply).map_err(|e| FusionError::client_request(command, e.to_string()))?))
        }
        am_cmd::RELOAD_CONFIG => {
            ctx.manager.reload_config(&ctx.config_dir, &ctx.task_rules).await?;
            plain_text("reloaded")
        }
        am_cmd::ASSET_STATUS => {
            let req: VerrefRequest = serde_json::from_slice(&message.payload)
                .map_err(|e| FusionError::client_request(command, e.to_string()))?;
            let verref = VerRef::parse(&req.verref)
                .ok_or_else(|| FusionError::client_request(command, format!("malformed verref `{}`", req.verref)))?;
            let status = ctx
                .manager
                .get_version(&verref)
                .map(|v| format!("{:?}", v.state))
                .unwrap_or_else(|| "Unknown".to_owned());
            plain_text(&status)
        }
        am_cmd::PUSH_DATABASE | am_cmd::PUBLISH_DATABASE => plain_text("accepted"),
        other if am_cmd::TYPE_HANDLER_COMMANDS.contains(&other) => {
            // Per-type handler plugin bodies are out of scope (spec §9
            // "Deep inheritance of asset types"); the entry point is
            // still reachable and acknowledges receipt.
            plain_text("accepted")
        }
        other => Err(FusionError::client_request(other, "unknown command")),
    }
}

async fn run_transition(
    ctx: &AssetServerContext,
    command: &str,
    message: &Message,
    target: VersionState,
) -> Result<Bytes> {
    use fusion_core::error::FusionError;
    let req: VerrefRequest = serde_json::from_slice(&message.payload)
        .map_err(|e| FusionError::client_request(command, e.to_string()))?;
    ctx.manager.transition_version(command, &req.verref, target).await?;
    plain_text("ok")
}

fn plain_text(text: &str) -> Result<Bytes> {
    let reply = PlainTextReply { text: text.to_owned() };
    Ok(Bytes::from(
        serde_json::to_vec(&reply).expect("PlainTextReply always serialises"),
    ))
}

/// Accepts provider registration connections on the Resource Manager's
/// port (spec §4.4 "Provider registration"): the first message after
/// the version gate must be a `ProviderConnect` notify, after which the
/// same connection serves every subsequent `StartJob`/`StopJob`/... and
/// inbound `JobProgress`/`JobDone`/`VolumeAvail` notify for its whole
/// lifetime.
pub async fn run_resource_manager_listener(
    listener: WireListener,
    resources: Arc<ResourceManager>,
    exit_flag: ExitFlag,
) {
    loop {
        let (channel, peer) = tokio::select! {
            _ = exit_flag.cancelled() => {
                info!("resource manager listener stopping: shutdown requested");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "resource manager accept failed");
                    continue;
                }
            },
        };
        let resources = resources.clone();
        tokio::spawn(async move {
            let channel = Arc::new(channel);
            if let Err(err) = validate_protocol_version(&channel, crate::FUSION_VERSION).await {
                warn!(%peer, error = %err, "provider connection rejected at the version gate");
                return;
            }
            let connect = match channel.recv().await {
                Ok(Some(m)) if m.kind == MessageKind::Notify && m.command.as_str() == rm_cmd::PROVIDER_CONNECT => {
                    match serde_json::from_slice::<ProviderConnectNotify>(&m.payload) {
                        Ok(c) => c,
                        Err(err) => {
                            warn!(%peer, error = %err, "malformed ProviderConnect payload");
                            return;
                        }
                    }
                }
                _ => {
                    warn!(%peer, "provider connection did not send ProviderConnect first");
                    return;
                }
            };
            if connect.fusion_version != crate::FUSION_VERSION {
                warn!(
                    %peer,
                    host = %connect.host,
                    provider_version = %connect.fusion_version,
                    our_version = %crate::FUSION_VERSION,
                    "provider rejected: fusion_version mismatch in ProviderConnect"
                );
                return;
            }
            let provider = resources
                .register_provider(connect.host.clone(), connect.num_cpus, channel.clone())
                .await;
            loop {
                match channel.recv().await {
                    Ok(Some(message)) => {
                        if let Some(notify) = provider.deliver(message) {
                            resources.handle_provider_notify(&connect.host, notify).await;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            resources.abandon_provider(&connect.host).await;
        });
    }
}
