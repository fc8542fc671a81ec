// Copyright (c) Facebook, Inc. and its affiliates.
pub mod client;
pub mod clock;
pub mod sanitize;
pub mod supervisor;
pub mod workload;

pub use client::SyncClient;
pub use sanitize::{sanitize, SanitizeError, Sanitized};
pub use supervisor::{become_reaper_if_init, Supervisor};
pub use workload::{lookup_workload, Workload, WorkloadExtras, WorkloadParams, WorkloadReport};
