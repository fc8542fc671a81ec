// Copyright (c) Facebook, Inc. and its affiliates.
use log::{error, info};

mod barrier;
mod context;
mod nameserver;
mod net;
mod results;
mod service;

use cb_intf::SyncArgs;
use cb_util::*;
use context::SyncServiceContext;
use service::SyncService;

fn main() {
    let args_file = SyncArgs::init_args_and_logging().unwrap_or_else(|e| {
        error!("cfg: Failed to process args ({:#})", &e);
        std::process::exit(1);
    });
    let args = &args_file.data;

    info!(
        "cb-sync {}: {} clients ({} in the first round), listening on {}, nameserver on {}",
        *cb_intf::VERSION,
        args.expected_clients,
        args.initial_expected_clients,
        args.listen_port,
        args.nameserver_port
    );

    let mut svc = SyncService::new(SyncServiceContext::new(args));
    let code = match svc.run() {
        Ok(()) => 0,
        Err(e) => {
            svc.fail(&e);
            1
        }
    };
    svc.finish();
    std::process::exit(code);
}
