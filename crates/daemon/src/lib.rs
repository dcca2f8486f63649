//! ripd - optical disc ripping daemon
//!
//! Background service that watches optical drives, rips inserted discs with
//! MakeMKV, transcodes them with HandBrake, and files the results into a
//! media library. The queue survives restarts: job records and completion
//! markers on disk let a crashed daemon resume without redoing finished work.

pub mod adapter;
pub mod artifacts;
pub mod daemon;
pub mod encode;
pub mod ingress;
pub mod jobs;
pub mod metadata;
pub mod naming;
pub mod pipeline;
pub mod rip;
pub mod scheduler;
pub mod startup;
pub mod status_server;

pub use ripd_config as config;
pub use ripd_config::Config;

pub use adapter::{
    DiscInfo, EncodeTool, FailureKind, MetadataLookup, RipRequest, RipTool, ToolFailure,
    ToolHandle, Tools,
};
pub use artifacts::{ArtifactError, ArtifactStore};
pub use daemon::{Daemon, DaemonError};
pub use encode::HandBrakeEncode;
pub use ingress::{DiscEvent, Ingress};
pub use jobs::{DiscMetadata, Job, JobStage, JobStore, StageAttempts, StoreError, TitleInfo};
pub use metadata::ArmLookup;
pub use naming::{sanitize_name, OutputNamer};
pub use rip::MakeMkvRip;
pub use scheduler::{
    effective_encode_slots, Command, JobSnapshot, Scheduler, SchedulerError, SchedulerHandle,
    SharedSnapshot,
};
pub use startup::{
    check_handbrake_available, check_makemkv_available, ensure_directories,
    parse_handbrake_version, run_startup_checks, StartupError,
};
pub use status_server::{create_status_router, run_status_server, ServerError};
