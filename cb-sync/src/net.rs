// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{debug, warn};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use cb_util::*;

pub const BIND_ATTEMPTS: u32 = 30;
pub const ACCEPT_FAILURES_MAX: u32 = 10;
pub const RETRY_DELAY: f64 = 1.0;

/// A peer which connected but doesn't send its token within this long is
/// dropped so that it can't wedge the round.
pub const TOKEN_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Bind `addr`, retrying while e.g. a previous incarnation's socket lingers.
pub fn bind_with_retry(addr: &SocketAddr, what: &str) -> Result<TcpListener> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match TcpListener::bind(addr) {
            Ok(listener) => {
                debug!("{}: listening on {:?}", what, addr);
                return Ok(listener);
            }
            Err(e) if attempt < BIND_ATTEMPTS => {
                if should_log_attempt(attempt) {
                    warn!("{}: failed to bind {:?} ({}), retrying", what, addr, &e);
                }
                sleep_secs(RETRY_DELAY);
            }
            Err(e) => bail!("{}: failed to bind {:?} ({})", what, addr, &e),
        }
    }
}

/// Accept the next connection. Interruptions are retried right away, other
/// errors with a delay up to `ACCEPT_FAILURES_MAX` times in a row.
pub fn accept_with_retry(listener: &TcpListener, what: &str) -> Result<(TcpStream, SocketAddr)> {
    let mut failures = 0;
    loop {
        match listener.accept() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                failures += 1;
                if failures >= ACCEPT_FAILURES_MAX {
                    bail!("{}: accept failed {} times ({})", what, failures, &e);
                }
                warn!("{}: accept failed ({}), retrying", what, &e);
                sleep_secs(RETRY_DELAY);
            }
        }
    }
}
