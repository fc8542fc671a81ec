// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use super::client::SyncClient;
use super::workload::{Workload, WorkloadParams};
use cb_intf::PodArgs;
use cb_util::*;

const WORKER_OK: i32 = 0;
const WORKER_FAILED: i32 = 1;

/// When running as pid 1 of a container, fork once. The parent stays
/// behind as the reaper of orphaned processes and exits with the child's
/// status when the child goes away. The child returns and carries on.
pub fn become_reaper_if_init() -> Result<()> {
    if getpid().as_raw() != 1 {
        return Ok(());
    }
    match unsafe { fork() }.context("supervisor: failed to fork off the reaper")? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => {
            info!("supervisor: running as init, reaping for pid {}", child);
            std::process::exit(reap_until(child))
        }
    }
}

fn reap_until(child: Pid) -> i32 {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == child => return code,
            Ok(WaitStatus::Signaled(pid, sig, _)) if pid == child => {
                return shell_status(None, Some(sig as i32))
            }
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                debug!("supervisor: reaped orphan {}", pid)
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                error!("supervisor: wait failed ({})", &e);
                return 1;
            }
        }
    }
}

struct Worker {
    idx: u32,
    err_rx: UnixStream,
}

impl Worker {
    /// Describe how the worker ended, `None` if it succeeded.
    fn failure(mut self, pid: Pid, status: WaitStatus) -> Option<String> {
        let mut msg = String::new();
        if let Err(e) = self.err_rx.read_to_string(&mut msg) {
            warn!("supervisor: failed to read error from worker {} ({})", self.idx, &e);
        }
        let msg = msg.trim();

        let what = match status {
            WaitStatus::Exited(_, WORKER_OK) if msg.is_empty() => return None,
            WaitStatus::Exited(_, code) if msg.is_empty() => format!("exited with status {}", code),
            WaitStatus::Exited(_, _) => msg.to_string(),
            WaitStatus::Signaled(_, sig, _) => format!("killed by {:?}", sig),
            other => format!("ended unexpectedly ({:?})", other),
        };
        Some(format!("worker {} (pid {}): {}", self.idx, pid, what))
    }
}

pub struct Supervisor {
    client: SyncClient,
    workload: &'static dyn Workload,
    params: WorkloadParams,
    processes: u32,
    announce: BTreeMap<String, String>,
    sentinel_dir: PathBuf,
}

impl Supervisor {
    pub fn new(args: &PodArgs, workload: &'static dyn Workload) -> Self {
        Self {
            client: SyncClient::new(args),
            workload,
            params: WorkloadParams {
                iterations: args.iterations,
                interval: args.interval,
            },
            processes: args.processes.max(1),
            announce: args.announce.iter().cloned().collect(),
            sentinel_dir: PathBuf::from(&args.sentinel_dir),
        }
    }

    fn touch_sentinel(&self, name: &str) {
        if let Err(e) = touch_sentinel(&self.sentinel_dir, name) {
            warn!("supervisor: {:#}", &e);
        }
    }

    /// Body of a forked worker: calibrate, run the workload, report.
    fn run_worker(&mut self, idx: u32) -> Result<()> {
        self.client.calibrate(&self.announce)?;
        let report = self.workload.run(&self.client, &self.params)?;
        self.client
            .report_results(report.data_start_time, report.data_end_time, &report.extras)?;
        debug!("supervisor: worker {} done", idx);
        Ok(())
    }

    fn spawn_worker(&mut self, idx: u32) -> Result<(Pid, Worker)> {
        let (err_rx, mut err_tx) =
            UnixStream::pair().context("supervisor: failed to create error channel")?;
        match unsafe { fork() }.context("supervisor: failed to fork worker")? {
            ForkResult::Child => {
                drop(err_rx);
                let code = match self.run_worker(idx) {
                    Ok(()) => WORKER_OK,
                    Err(e) => {
                        error!("supervisor: worker {} failed ({:#})", idx, &e);
                        let _ = err_tx.write_all(format!("{:#}", &e).as_bytes());
                        WORKER_FAILED
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => Ok((child, Worker { idx, err_rx })),
        }
    }

    /// Sweep up workers which have already exited without blocking.
    fn reap_exited(
        workers: &mut HashMap<Pid, Worker>,
        failures: &mut Vec<String>,
    ) -> Result<()> {
        while !workers.is_empty() {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => Self::record(workers, failures, status),
                Err(Errno::EINTR) => {}
                Err(e) => bail!("supervisor: wait failed ({})", &e),
            }
        }
        Ok(())
    }

    fn record(workers: &mut HashMap<Pid, Worker>, failures: &mut Vec<String>, status: WaitStatus) {
        let pid = match status.pid() {
            Some(pid) => pid,
            None => return,
        };
        if let WaitStatus::Exited(..) | WaitStatus::Signaled(..) = status {
            if let Some(worker) = workers.remove(&pid) {
                if let Some(msg) = worker.failure(pid, status) {
                    error!("supervisor: {}", &msg);
                    failures.push(msg);
                }
            }
        }
    }

    /// Fork the workers and wait for them. The first failure is reported
    /// to the sync service right away, together with any other failures
    /// already known, so that workers blocked in a barrier get released.
    pub fn run_workload(&mut self) -> Result<()> {
        info!(
            "supervisor: starting {} {} workers",
            self.processes,
            self.workload.name()
        );
        self.touch_sentinel(STARTED_SENTINEL);

        let mut workers = HashMap::new();
        for idx in 0..self.processes {
            let (pid, worker) = self.spawn_worker(idx)?;
            debug!("supervisor: worker {} is pid {}", idx, pid);
            workers.insert(pid, worker);
        }

        let mut failures: Vec<String> = vec![];
        let mut reported = false;
        while !workers.is_empty() {
            match waitpid(None::<Pid>, None) {
                Ok(status) => Self::record(&mut workers, &mut failures, status),
                Err(Errno::EINTR) => continue,
                Err(e) => bail!("supervisor: wait failed ({})", &e),
            }

            if !failures.is_empty() && !reported {
                Self::reap_exited(&mut workers, &mut failures)?;
                if let Err(e) = self.client.report_failure(&failures.join("; ")) {
                    error!("supervisor: failed to report failure ({:#})", &e);
                }
                reported = true;
            }
        }

        self.touch_sentinel(FINISHED_SENTINEL);
        if failures.is_empty() {
            info!("supervisor: all {} workers succeeded", self.processes);
            Ok(())
        } else {
            bail!("{} of {} workers failed", failures.len(), self.processes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{reap_until, Worker, WORKER_OK};
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    fn fork_child<F: FnOnce() -> i32>(body: F) -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe { libc::_exit(body()) },
            ForkResult::Parent { child } => child,
        }
    }

    fn worker(msg: &str) -> Worker {
        let (err_rx, mut err_tx) = UnixStream::pair().unwrap();
        err_tx.write_all(msg.as_bytes()).unwrap();
        Worker { idx: 3, err_rx }
    }

    #[test]
    fn test_worker_failure() {
        let pid = Pid::from_raw(4242);
        assert_eq!(
            worker("").failure(pid, WaitStatus::Exited(pid, WORKER_OK)),
            None
        );
        assert_eq!(
            worker("disk full\n").failure(pid, WaitStatus::Exited(pid, 1)),
            Some("worker 3 (pid 4242): disk full".to_string())
        );
        assert_eq!(
            worker("").failure(pid, WaitStatus::Exited(pid, 7)),
            Some("worker 3 (pid 4242): exited with status 7".to_string())
        );
        assert_eq!(
            worker("").failure(pid, WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some("worker 3 (pid 4242): killed by SIGKILL".to_string())
        );
    }

    // Both cases share one test as reap_until() collects any child.
    #[test]
    fn test_reap_until() {
        let _ = ::env_logger::try_init();

        let orphan = fork_child(|| 0);
        let child = fork_child(|| {
            thread::sleep(Duration::from_millis(300));
            3
        });
        assert_eq!(reap_until(child), 3);
        assert_eq!(
            waitpid(orphan, Some(WaitPidFlag::WNOHANG)).unwrap_err(),
            Errno::ECHILD
        );

        let child = fork_child(|| {
            thread::sleep(Duration::from_secs(30));
            0
        });
        kill(child, Signal::SIGTERM).unwrap();
        assert_eq!(reap_until(child), 128 + libc::SIGTERM);
    }
}
