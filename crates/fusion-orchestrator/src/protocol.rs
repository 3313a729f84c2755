//! Command name catalogue and wire payload types for both managers
//! (spec §6 "Command catalogue"). Dispatch itself lives with the state
//! it mutates (`assets::manager::AssetManager::handle_request`,
//! `resources::manager::ResourceManager::handle_provider_notify`); this
//! module only names the commands and shapes their payloads, mirroring
//! the application-registration pattern of the teacher's switching
//! layer (one module naming every application surface a session can
//! reach).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Requests the Asset Manager's dispatcher answers directly.
pub mod asset_manager_commands {
    pub const VALIDATE_PROTOCOL_VERSION: &str = "ValidateProtocolVersion";
    pub const BUILD: &str = "Build";
    pub const CANCEL_VERSION: &str = "CancelVersion";
    pub const REBUILD_VERSION: &str = "RebuildVersion";
    pub const SET_BAD_VERSION: &str = "SetBadVersion";
    pub const CLEAR_BAD_VERSION: &str = "ClearBadVersion";
    pub const CLEAN_VERSION: &str = "CleanVersion";
    pub const PRODUCT_REIMPORT: &str = "ProductReImport";
    pub const GET_CURR_TASKS: &str = "GetCurrTasks";
    pub const RELOAD_CONFIG: &str = "ReloadConfig";
    pub const ASSET_STATUS: &str = "AssetStatus";
    pub const PUSH_DATABASE: &str = "PushDatabase";
    pub const PUBLISH_DATABASE: &str = "PublishDatabase";

    /// Per-asset-type handler entry points (spec §9 "Deep inheritance of
    /// asset types"): forwarded to the owning asset's handler plugin.
    /// Plugin bodies are out of scope; only the entry point names are
    /// part of this catalogue.
    pub const TYPE_HANDLER_COMMANDS: &[&str] = &[
        "RasterProductImport",
        "RasterProjectEdit",
        "RasterProjectNew",
        "RasterProjectModify",
        "RasterProjectAddTo",
        "RasterProjectDropFrom",
        "VectorProductImport",
        "VectorLayerXEdit",
        "VectorProjectEdit",
        "VectorProjectNew",
        "VectorProjectModify",
        "VectorProjectAddTo",
        "VectorProjectDropFrom",
        "DatabaseEdit",
        "DatabaseNew",
        "DatabaseModify",
        "MapDatabaseEdit",
        "MapDatabaseNew",
        "MapDatabaseModify",
        "MercatorMapDatabaseEdit",
        "MercatorMapDatabaseNew",
        "MercatorMapDatabaseModify",
        "MapProjectEdit",
        "MapLayerEdit",
        "KMLProjectEdit",
        "MakeAssetDir",
    ];

    pub const ASSET_CHANGES_REGISTER: &str = "AssetChanges";
}

/// Notifies the Resource Manager sends the Asset Manager, and requests
/// the Resource Manager answers from providers.
pub mod resource_manager_commands {
    pub const TASK_LOST: &str = "TaskLost";
    pub const TASK_PROGRESS: &str = "TaskProgress";
    pub const TASK_DONE: &str = "TaskDone";

    pub const PROVIDER_CONNECT: &str = "ProviderConnect";
    pub const JOB_PROGRESS: &str = "JobProgress";
    pub const JOB_DONE: &str = "JobDone";
    pub const VOLUME_AVAIL: &str = "VolumeAvail";

    pub const START_JOB: &str = "StartJob";
    pub const STOP_JOB: &str = "StopJob";
    pub const CHANGE_VOLUME_RESERVATIONS: &str = "ChangeVolumeReservations";
    pub const CLEANUP_VOLUME: &str = "CleanupVolume";
    pub const CLEAN_PATH: &str = "CleanPath";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateProtocolVersionRequest {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub asset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReply {
    pub needed_new_version: bool,
    pub verref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerrefRequest {
    pub verref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductReImportRequest {
    pub asset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductReImportReply {
    pub import_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetCurrTasksReply {
    pub waiting: Vec<String>,
    pub active: HashMap<String, Vec<u32>>,
    pub num_cache_hits: u64,
    pub num_cache_misses: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlainTextReply {
    pub text: String,
}

/// `SubmitTask` / `DeleteTask` are internal Asset-Manager-to-Resource-
/// Manager commands (spec §4.3 "Submit / Delete task commands"); they
/// never cross the wire, only the `taskCmdQueue`.
#[derive(Debug, Clone)]
pub enum TaskCommand {
    SubmitTask {
        verref: String,
        taskid: u32,
        priority: i32,
        taskdef: crate::resources::requirements::TaskDef,
    },
    DeleteTask {
        verref: String,
    },
    /// `BumpDownBlockers`, the "always" command pushed after processing
    /// a `TaskDone`/`TaskLost` notification (spec §4.3 "Blockers").
    BumpDownBlockers,
}

/// Notifications the Resource Manager pushes to the Asset Manager's
/// `AssetCmd` queue (spec §4.2 "Notify surface"). Each bumps
/// `numActivateBlockers` up on send; the Asset Manager's transaction
/// processing it must reply with `TaskCommand::BumpDownBlockers`.
#[derive(Debug, Clone)]
pub enum AssetNotify {
    TaskLost { verref: String, taskid: u32 },
    TaskProgress { verref: String, taskid: u32, progress: f32 },
    TaskDone { verref: String, taskid: u32, success: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConnectNotify {
    pub host: String,
    pub num_cpus: u32,
    pub fusion_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressNotify {
    pub taskid: u32,
    pub begin_time: u64,
    pub progress_time: u64,
    pub progress: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDoneNotify {
    pub taskid: u32,
    pub success: bool,
    pub begin_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeAvailNotify {
    pub volname: String,
    pub serial: u32,
    pub avail: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartJobRequest {
    pub taskid: u32,
    pub log_file: String,
    pub commands: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopJobRequest {
    pub taskid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeVolumeReservationsRequest {
    pub volname: String,
    pub serial: u32,
    pub reservations: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupVolumeRequest {
    pub volname: String,
    pub serial: u32,
    pub reservations: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanPathRequest {
    pub local_path: String,
}
