// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use thiserror::Error;

use super::barrier::{BarrierRound, RoundStatus};
use super::context::SyncServiceContext;
use super::nameserver::NameServer;
use super::net::bind_with_retry;
use super::results::{collect_results, hand_off_results};
use cb_util::*;

const ROUND_CONTINUE: i32 = 0;
const ROUND_FAILURE_REPORTED: i32 = 1;
const ROUND_FINISHED: i32 = 2;
const ROUND_ERROR: i32 = 3;

/// The job failed and the failure has already been handed to the
/// controller through the error file.
#[derive(Debug, Error)]
#[error("failure already reported to the controller")]
pub struct FailureReported;

pub struct SyncService {
    ctx: SyncServiceContext,
    nameserver: Option<Pid>,
}

impl SyncService {
    pub fn new(ctx: SyncServiceContext) -> Self {
        Self {
            ctx,
            nameserver: None,
        }
    }

    /// Run the job to completion. On success the results have been picked
    /// up by the controller.
    pub fn run(&mut self) -> Result<()> {
        let listener = bind_with_retry(&self.ctx.listen_addr, "sync")?;
        self.ctx.load_controller_timing()?;
        self.start_nameserver()?;

        let mut expected = self.ctx.initial_expected_clients;
        let mut round: u64 = 0;
        loop {
            round += 1;
            let status = self.fork_round(&listener, round, expected)?;

            if round == 1 {
                self.ctx.touch_sentinel(STARTED_SENTINEL);
            }
            if status == RoundStatus::Finished {
                break;
            }
            if round == 1 && self.ctx.predelay > 0.0 {
                info!("sync: sleeping {}s before the next round", self.ctx.predelay);
                sleep_secs(self.ctx.predelay);
            }
            expected = self.ctx.expected_clients;
        }
        info!("sync: job finished after {} rounds", round);

        if self.ctx.postdelay > 0.0 {
            info!("sync: sleeping {}s before collecting results", self.ctx.postdelay);
            sleep_secs(self.ctx.postdelay);
        }
        let result = collect_results(&self.ctx, expected)?;
        hand_off_results(&self.ctx, result)?;
        Ok(())
    }

    /// Report `err` through the error file unless a round already did.
    pub fn fail(&self, err: &anyhow::Error) {
        if err.downcast_ref::<FailureReported>().is_some() {
            return;
        }
        if let Err(e) = self.ctx.report_failure(&format!("{:#}", err)) {
            error!("sync: failed to report failure ({:#})", &e);
        }
    }

    /// Touch the finished sentinel and tear down the nameserver.
    pub fn finish(&mut self) {
        self.ctx.touch_sentinel(FINISHED_SENTINEL);
        self.stop_nameserver();
    }

    fn start_nameserver(&mut self) -> Result<()> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.ctx.nameserver_addr.port()));
        let listener = bind_with_retry(&addr, "nameserver")?;

        match unsafe { fork() }.context("failed to fork nameserver")? {
            ForkResult::Child => {
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                }
                let code = match NameServer::new(&self.ctx.nonce).serve(&listener) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("nameserver: {:#}", &e);
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                info!("sync: nameserver started as pid {}", child);
                self.nameserver = Some(child);
                Ok(())
            }
        }
    }

    fn stop_nameserver(&mut self) {
        if let Some(pid) = self.nameserver.take() {
            debug!("sync: stopping nameserver pid {}", pid);
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                warn!("sync: failed to kill nameserver pid {} ({})", pid, &e);
                return;
            }
            if let Err(e) = waitpid(pid, None) {
                warn!("sync: failed to reap nameserver pid {} ({})", pid, &e);
            }
        }
    }

    /// Run one round in a child process so that nothing the round opened
    /// outlives it.
    fn fork_round(&self, listener: &TcpListener, round: u64, expected: u32) -> Result<RoundStatus> {
        debug!("sync: starting round {} with {} clients", round, expected);
        match unsafe { fork() }.with_context(|| format!("failed to fork round {}", round))? {
            ForkResult::Child => std::process::exit(self.run_round_child(listener, expected)),
            ForkResult::Parent { child } => self.wait_round(child, round),
        }
    }

    fn run_round_child(&self, listener: &TcpListener, expected: u32) -> i32 {
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            if self.ctx.round_timeout > 0 {
                libc::alarm(self.ctx.round_timeout);
            }
        }

        let failure = match BarrierRound::new(&self.ctx, expected).run(listener) {
            Ok(RoundStatus::Continue) => return ROUND_CONTINUE,
            Ok(RoundStatus::Finished) => return ROUND_FINISHED,
            Ok(RoundStatus::Failed(msg)) => msg,
            Err(e) => format!("{:#}", &e),
        };

        unsafe {
            libc::alarm(0);
        }
        match self.ctx.report_failure(&failure) {
            Ok(()) => ROUND_FAILURE_REPORTED,
            Err(e) => {
                error!("sync: failed to report failure ({:#})", &e);
                ROUND_ERROR
            }
        }
    }

    fn wait_round(&self, child: Pid, round: u64) -> Result<RoundStatus> {
        loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, ROUND_CONTINUE)) => return Ok(RoundStatus::Continue),
                Ok(WaitStatus::Exited(_, ROUND_FINISHED)) => return Ok(RoundStatus::Finished),
                Ok(WaitStatus::Exited(_, ROUND_FAILURE_REPORTED)) => {
                    return Err(FailureReported.into())
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    bail!("round {} process exited with status {}", round, code)
                }
                Ok(WaitStatus::Signaled(_, Signal::SIGALRM, _)) => bail!(
                    "round {} timed out after {}s",
                    round,
                    self.ctx.round_timeout
                ),
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    bail!("round {} process killed by {:?}", round, sig)
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => bail!("failed to wait for round {} ({})", round, &e),
            }
        }
    }
}
