// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{error, info};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use cb_intf::{ControllerTimestamps, ControllerTiming, SyncArgs};
use cb_util::*;

/// Everything the rounds, the nameserver and the result handling need to
/// know about the job. Built once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct SyncServiceContext {
    pub nonce: String,
    pub sync_file: PathBuf,
    pub error_file: PathBuf,
    pub controller_timestamp_file: PathBuf,
    pub sentinel_dir: PathBuf,

    pub predelay: f64,
    pub postdelay: f64,
    pub step_interval: f64,
    pub poll_interval: f64,
    pub round_timeout: u32,

    pub listen_addr: SocketAddr,
    pub nameserver_addr: SocketAddr,
    pub expected_clients: u32,
    pub initial_expected_clients: u32,

    pub controller_timing: ControllerTiming,
}

impl SyncServiceContext {
    pub fn new(args: &SyncArgs) -> Self {
        Self {
            nonce: args.nonce.clone(),
            sync_file: PathBuf::from(&args.sync_file),
            error_file: PathBuf::from(&args.error_file),
            controller_timestamp_file: PathBuf::from(&args.controller_timestamp_file),
            sentinel_dir: PathBuf::from(&args.sentinel_dir),
            predelay: args.predelay,
            postdelay: args.postdelay,
            step_interval: args.step_interval,
            poll_interval: args.poll_interval,
            round_timeout: args.round_timeout,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.listen_port)),
            nameserver_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, args.nameserver_port)),
            expected_clients: args.expected_clients,
            initial_expected_clients: args.initial_expected_clients,
            controller_timing: Default::default(),
        }
    }

    /// Current time on the controller's clock.
    pub fn reference_now(&self) -> f64 {
        now() - self.controller_timing.sync_offset_from_controller
    }

    /// Where a round stores the result submitted while `remaining` clients
    /// were still outstanding.
    pub fn round_result_path(&self, remaining: u32) -> PathBuf {
        let mut path = self.sync_file.clone().into_os_string();
        path.push(format!("-tmp.{}", remaining));
        PathBuf::from(path)
    }

    fn error_tmp_path(&self) -> PathBuf {
        let mut path = self.error_file.clone().into_os_string();
        path.push("-tmp");
        PathBuf::from(path)
    }

    /// Read and consume the controller's timestamp file, waiting for it to
    /// show up if necessary.
    pub fn load_controller_timing(&mut self) -> Result<()> {
        let path = &self.controller_timestamp_file;
        wait_for_file(path, self.poll_interval);

        let ts = ControllerTimestamps::load(path)?;
        fs::remove_file(path).with_context(|| format!("failed to remove {:?}", path))?;
        self.controller_timing = ts.into();
        info!(
            "sync: controller rtt {}, sync clock offset from controller {:.6}s",
            format_duration(self.controller_timing.controller_rtt),
            self.controller_timing.sync_offset_from_controller
        );
        Ok(())
    }

    /// Hand a failure message to the controller through the error file and
    /// wait for the controller to acknowledge it by removing the file.
    pub fn report_failure(&self, msg: &str) -> Result<()> {
        error!("sync: job failed: {}", msg);
        write_and_link(&self.error_tmp_path(), &self.error_file, msg)?;
        wait_for_removal(&self.error_file, self.poll_interval);
        Ok(())
    }

    pub fn touch_sentinel(&self, name: &str) {
        if let Err(e) = touch_sentinel(&self.sentinel_dir, name) {
            error!("sync: {:#}", &e);
        }
    }
}

pub fn remove_if_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {:?}", path)),
    }
}

#[cfg(test)]
pub fn test_context(dir: &Path, expected_clients: u32) -> SyncServiceContext {
    let mut args = SyncArgs::default();
    args.nonce = "test-nonce".into();
    args.sync_file = dir.join("sync.json").to_string_lossy().to_string();
    args.error_file = dir.join("error").to_string_lossy().to_string();
    args.controller_timestamp_file = dir.join("controller.json").to_string_lossy().to_string();
    args.sentinel_dir = dir.to_string_lossy().to_string();
    args.poll_interval = 0.01;
    args.expected_clients = expected_clients;
    args.initial_expected_clients = expected_clients;
    SyncServiceContext::new(&args)
}
