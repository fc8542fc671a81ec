// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};

use super::timing::{ControllerTiming, TimingParameters};
use cb_util::*;

pub const RESULT_APPLICATION: &str = "clusterbuster-json";

/// The file the sync service hands to the controller at the end of a job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub controller_timing: ControllerTiming,
    pub worker_results: Vec<serde_json::Value>,
}

impl JsonLoad for SyncResult {}
impl JsonSave for SyncResult {}

/// One worker's `rslt` payload. Workload specific fields are flattened in
/// after the common ones.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerResult {
    pub application: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub process_id: u32,
    pub pod_create_time: f64,
    pub pod_start_time: f64,
    pub data_start_time: f64,
    pub data_end_time: f64,
    pub data_elapsed_time: f64,
    pub user_cpu_time: f64,
    pub system_cpu_time: f64,
    pub cpu_time: f64,
    pub timing_parameters: TimingParameters,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
