// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::debug;
use serde::Serialize;

use super::client::SyncClient;
use cb_util::*;

#[derive(Debug, Clone)]
pub struct WorkloadParams {
    pub iterations: u32,
    pub interval: f64,
}

/// What a workload hands back for its result report. Times are in
/// controller-relative seconds as returned by `SyncClient::adjusted_time()`.
#[derive(Debug, Clone)]
pub struct WorkloadReport {
    pub data_start_time: f64,
    pub data_end_time: f64,
    pub extras: WorkloadExtras,
}

/// Workload specific fields merged into the result report. Kept typed so
/// that non-finite values are still visible when the report is sanitized.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WorkloadExtras {
    SyncTest {
        workload: &'static str,
        iterations: u32,
        sync_latency: LatencyStats,
    },
    Sleep {
        workload: &'static str,
        sleep_time: f64,
    },
}

pub trait Workload: Sync {
    fn name(&self) -> &'static str;
    fn run(&self, client: &SyncClient, params: &WorkloadParams) -> Result<WorkloadReport>;
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    stdev: Option<f64>,
}

impl LatencyStats {
    fn new(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self {
                min: None,
                max: None,
                mean: None,
                stdev: None,
            };
        }
        let nr = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / nr;
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / nr;
        Self {
            min: Some(samples.iter().cloned().fold(f64::INFINITY, f64::min)),
            max: Some(samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
            mean: Some(mean),
            stdev: Some(var.sqrt()),
        }
    }
}

/// Go through the barrier `iterations` times and report how long each
/// passage took.
struct SyncTest;

impl Workload for SyncTest {
    fn name(&self) -> &'static str {
        "synctest"
    }

    fn run(&self, client: &SyncClient, params: &WorkloadParams) -> Result<WorkloadReport> {
        let data_start_time = client.adjusted_time();
        let mut latencies = Vec::with_capacity(params.iterations as usize);
        for i in 0..params.iterations {
            let started_at = now();
            client.sync_to_controller(None)?;
            latencies.push(now() - started_at);
            debug!("synctest: iteration {} took {}", i, format_duration(latencies[i as usize]));
            if params.interval > 0.0 {
                sleep_secs(params.interval);
            }
        }
        let data_end_time = client.adjusted_time();

        Ok(WorkloadReport {
            data_start_time,
            data_end_time,
            extras: WorkloadExtras::SyncTest {
                workload: self.name(),
                iterations: params.iterations,
                sync_latency: LatencyStats::new(&latencies),
            },
        })
    }
}

/// Sleep for `interval` between two barriers.
struct Sleep;

impl Workload for Sleep {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn run(&self, client: &SyncClient, params: &WorkloadParams) -> Result<WorkloadReport> {
        client.sync_to_controller(None)?;
        let data_start_time = client.adjusted_time();
        sleep_secs(params.interval);
        let data_end_time = client.adjusted_time();
        client.sync_to_controller(None)?;

        Ok(WorkloadReport {
            data_start_time,
            data_end_time,
            extras: WorkloadExtras::Sleep {
                workload: self.name(),
                sleep_time: params.interval,
            },
        })
    }
}

static WORKLOADS: &[&dyn Workload] = &[&SyncTest, &Sleep];

pub fn workload_names() -> Vec<&'static str> {
    WORKLOADS.iter().map(|w| w.name()).collect()
}

pub fn lookup_workload(name: &str) -> Result<&'static dyn Workload> {
    match WORKLOADS.iter().find(|w| w.name() == name) {
        Some(w) => Ok(*w),
        None => bail!(
            "unknown workload {:?}, available: {}",
            name,
            workload_names().join(", ")
        ),
    }
}
