// Copyright (c) Facebook, Inc. and its affiliates.
use log::{error, info};

use cb_intf::PodArgs;
use cb_pod::{become_reaper_if_init, lookup_workload, Supervisor};
use cb_util::*;

fn main() {
    let args_file = PodArgs::init_args_and_logging().unwrap_or_else(|e| {
        error!("cfg: Failed to process args ({:#})", &e);
        std::process::exit(1);
    });
    let args = &args_file.data;

    if let Err(e) = become_reaper_if_init() {
        error!("{:#}", &e);
        std::process::exit(1);
    }

    let workload = lookup_workload(&args.workload).unwrap_or_else(|e| {
        error!("cfg: {:#}", &e);
        std::process::exit(1);
    });

    info!(
        "cb-pod {}: {} {} workers in {}/{}, sync service at {}:{}",
        *cb_intf::VERSION,
        args.processes,
        workload.name(),
        &args.namespace,
        &args.pod,
        &args.sync_host,
        args.sync_port
    );

    let mut supervisor = Supervisor::new(args, workload);
    if let Err(e) = supervisor.run_workload() {
        error!("supervisor: {:#}", &e);
        std::process::exit(1);
    }
}
