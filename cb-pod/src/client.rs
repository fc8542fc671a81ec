// Copyright (c) Facebook, Inc. and its affiliates.

//! The pod side of the sync protocol.
//!
//! Every worker process owns a `SyncClient`. It calibrates its clock
//! against the sync service once, then joins barrier rounds with
//! `sync_to_controller()` and finally submits its result. All timestamps
//! handed to the controller are in seconds since the controller's base
//! time, on the controller's clock.
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::net::TcpStream;

use super::clock::{timing_parameters, ClockSample};
use super::sanitize::sanitize;
use cb_intf::{
    Command, NsMessage, NsReply, PodArgs, TimeReply, TimingParameters, TnetRequest, Token,
    WorkerResult, RESULT_APPLICATION,
};
use cb_util::*;

const CONNECT_RETRY_DELAY: f64 = 1.0;

fn timeval_secs(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

/// User and system CPU time of the calling process.
pub fn cpu_times() -> Result<(f64, f64)> {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut ru) } != 0 {
        bail!("getrusage failed ({})", io::Error::last_os_error());
    }
    Ok((timeval_secs(&ru.ru_utime), timeval_secs(&ru.ru_stime)))
}

#[derive(Debug, Clone)]
pub struct SyncClient {
    sync_addr: String,
    ns_addr: String,
    nonce: String,
    connect_timeout: f64,

    basetime: f64,
    crtime: f64,
    start_time: f64,

    namespace: String,
    pod: String,
    container: String,

    timing: Option<TimingParameters>,
}

impl SyncClient {
    pub fn new(args: &PodArgs) -> Self {
        Self {
            sync_addr: format!("{}:{}", &args.sync_host, args.sync_port),
            ns_addr: format!("{}:{}", &args.sync_host, args.ns_port),
            nonce: args.nonce.clone(),
            connect_timeout: args.connect_timeout,
            basetime: args.basetime,
            crtime: args.crtime,
            start_time: now(),
            namespace: args.namespace.clone(),
            pod: args.pod.clone(),
            container: args.container.clone(),
            timing: None,
        }
    }

    pub fn timing(&self) -> Option<&TimingParameters> {
        self.timing.as_ref()
    }

    fn identity(&self) -> String {
        format!("{}:{}:{}", &self.namespace, &self.pod, &self.container)
    }

    /// Connect to `addr`, retrying once a second until it succeeds or the
    /// connect timeout, if any, expires.
    fn connect_to(&self, addr: &str) -> Result<TcpStream> {
        let started_at = now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match TcpStream::connect(addr) {
                Ok(conn) => {
                    if attempt > 1 {
                        debug!("client: connected to {} after {} attempts", addr, attempt);
                    }
                    return Ok(conn);
                }
                Err(e) => e,
            };

            let elapsed = now() - started_at;
            if self.connect_timeout > 0.0 && elapsed >= self.connect_timeout {
                bail!(
                    "client: failed to connect to {} within {} ({})",
                    addr,
                    format_duration(self.connect_timeout),
                    &err
                );
            }
            if should_log_attempt(attempt) {
                info!(
                    "client: failed to connect to {} ({}), retrying (attempt {})",
                    addr, &err, attempt
                );
            }

            let mut delay = CONNECT_RETRY_DELAY;
            if self.connect_timeout > 0.0 {
                delay = delay.min(self.connect_timeout - elapsed);
            }
            sleep_secs(delay);
        }
    }

    fn send(&self, conn: &mut TcpStream, command: Command, payload: &str) -> Result<()> {
        Token::new(command, &self.nonce, payload)
            .write_to(conn)
            .with_context(|| format!("client: failed to send {}", command))
    }

    fn receive(&self, conn: &mut TcpStream, command: Command) -> Result<Token> {
        let token = Token::read_from(conn)
            .with_context(|| format!("client: failed to receive {} reply", command))?
            .ok_or_else(|| anyhow!("client: connection closed while waiting for {} reply", command))?;
        if token.nonce != self.nonce {
            bail!("client: {} reply carries a foreign nonce", command);
        }
        if token.command != command {
            bail!("client: expected {} reply, got {}", command, token.command);
        }
        Ok(token)
    }

    /// Measure the clock offset against the sync service. Happens once per
    /// process, later calls are no-ops. Non-empty `addresses` are announced
    /// to the nameserver as part of the exchange.
    pub fn calibrate(&mut self, addresses: &BTreeMap<String, String>) -> Result<()> {
        if self.timing.is_some() {
            debug!("client: clock already calibrated");
            return Ok(());
        }

        let mut conn = self.connect_to(&self.sync_addr)?;
        let local_sync_start = now();
        let command = if addresses.is_empty() {
            self.send(&mut conn, Command::Time, &format!("{}", local_sync_start))?;
            Command::Time
        } else {
            let req = TnetRequest {
                client_ts: local_sync_start,
                addresses: addresses.clone(),
            };
            self.send(&mut conn, Command::Tnet, &serde_json::to_string(&req)?)?;
            Command::Tnet
        };
        let token = self.receive(&mut conn, command)?;
        let local_sync = now();

        let reply = TimeReply::parse(&token.payload)?;
        if reply.client_ts != local_sync_start {
            warn!(
                "client: time reply echoes {} instead of {}",
                reply.client_ts, local_sync_start
            );
        }

        let sample = ClockSample::new(local_sync_start, local_sync, &reply);
        let tp = timing_parameters(self.basetime, self.crtime, self.start_time, &sample);
        info!(
            "client: clock offset from controller {:.6}s (rtt local {} remote {})",
            tp.local_offset_from_sync,
            format_duration(tp.local_sync_rtt),
            format_duration(tp.remote_sync_rtt)
        );
        self.timing = Some(tp);
        Ok(())
    }

    /// Seconds since the controller's base time, on the controller's clock.
    pub fn adjusted_time(&self) -> f64 {
        match self.timing.as_ref() {
            Some(tp) => now() - tp.xtime_adjustment,
            None => now() - self.basetime,
        }
    }

    /// Wait at the barrier until every client of the job has arrived.
    pub fn sync_to_controller(&self, token: Option<&str>) -> Result<()> {
        let payload = match token {
            Some(v) => v.to_string(),
            None => format!(
                "{}-{}-{}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"),
                self.identity(),
                rand::random::<u32>()
            ),
        };
        let mut conn = self.connect_to(&self.sync_addr)?;
        self.send(&mut conn, Command::Sync, &payload)?;
        self.receive(&mut conn, Command::Sync)?;
        debug!("client: released from barrier ({})", &payload);
        Ok(())
    }

    /// Submit this worker's result. `extras` must serialize to a map and is
    /// merged after the common fields. Returns the number of non-finite
    /// values replaced with null.
    pub fn report_results<T: Serialize + ?Sized>(
        &self,
        data_start_time: f64,
        data_end_time: f64,
        extras: &T,
    ) -> Result<usize> {
        let tp = self
            .timing
            .clone()
            .ok_or_else(|| anyhow!("client: reporting results before clock calibration"))?;
        let (user_cpu_time, system_cpu_time) = cpu_times()?;

        let extras = sanitize(extras)?;
        let extra = match extras.value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => Default::default(),
            v => bail!("client: result extras must be a map, got {}", &v),
        };

        let result = WorkerResult {
            application: RESULT_APPLICATION.into(),
            namespace: self.namespace.clone(),
            pod: self.pod.clone(),
            container: self.container.clone(),
            process_id: std::process::id(),
            pod_create_time: tp.controller_crtime - tp.controller_basetime,
            pod_start_time: self.start_time - tp.xtime_adjustment,
            data_start_time,
            data_end_time,
            data_elapsed_time: data_end_time - data_start_time,
            user_cpu_time,
            system_cpu_time,
            cpu_time: user_cpu_time + system_cpu_time,
            timing_parameters: tp,
            extra,
        };
        let sanitized = sanitize(&result)?;
        let nr_replaced = extras.nr_replaced + sanitized.nr_replaced;
        if nr_replaced > 0 {
            warn!(
                "client: {} non-finite values in the result replaced with null",
                nr_replaced
            );
        }

        let mut conn = self.connect_to(&self.sync_addr)?;
        self.send(&mut conn, Command::Rslt, &serde_json::to_string(&sanitized.value)?)?;
        self.receive(&mut conn, Command::Rslt)?;
        info!("client: results accepted");
        Ok(nr_replaced)
    }

    /// Tell the sync service the job failed. Ends the current round for
    /// everyone, so there's no reply to wait for.
    pub fn report_failure(&self, msg: &str) -> Result<()> {
        let mut conn = self.connect_to(&self.sync_addr)?;
        self.send(&mut conn, Command::Fail, msg)?;
        info!("client: reported failure");
        Ok(())
    }

    /// Look up `names` with the nameserver, blocking until all are known.
    pub fn resolve_names<I: IntoIterator<Item = String>>(&self, names: I) -> Result<NsReply> {
        let msg = NsMessage::rqst(names);
        let mut conn = self.connect_to(&self.ns_addr)?;
        self.send(&mut conn, Command::Nsrq, &serde_json::to_string(&msg)?)?;
        let token = self.receive(&mut conn, Command::Nsrq)?;
        let resolved: NsReply = serde_json::from_str(&token.payload)
            .context("client: invalid nameserver reply")?;
        debug!("client: resolved {:?}", &resolved);
        Ok(resolved)
    }

    pub fn announce_names(&self, have: &BTreeMap<String, String>) -> Result<()> {
        let mut conn = self.connect_to(&self.ns_addr)?;
        let msg = NsMessage::have(have.clone());
        self.send(&mut conn, Command::Nsrq, &serde_json::to_string(&msg)?)
    }
}

#[cfg(test)]
mod tests {
    use super::SyncClient;
    use cb_intf::{Command, PodArgs, TimeReply, Token};
    use cb_util::*;
    use serde::Serialize;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::net::TcpListener;
    use std::thread;

    #[derive(Serialize)]
    struct Throughput {
        iterations: u32,
        rate: f64,
        samples: Vec<f64>,
    }

    fn client_for(listener: &TcpListener) -> SyncClient {
        let mut args = PodArgs::default();
        args.sync_host = "127.0.0.1".into();
        args.sync_port = listener.local_addr().unwrap().port();
        args.nonce = "pod-nonce".into();
        args.basetime = now() - 100.0;
        args.crtime = args.basetime + 2.0;
        args.namespace = "cb-ns".into();
        args.pod = "cb-pod-0".into();
        args.container = "c0".into();
        args.connect_timeout = 0.5;
        SyncClient::new(&args)
    }

    // Serve one connection: hand the request to `reply` and send back what
    // it returns, if anything.
    fn serve_one<F>(listener: TcpListener, reply: F) -> thread::JoinHandle<Token>
    where
        F: FnOnce(&Token) -> Option<Token> + Send + 'static,
    {
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let req = Token::read_from(&mut conn).unwrap().unwrap();
            if let Some(tok) = reply(&req) {
                tok.write_to(&mut conn).unwrap();
            }
            req
        })
    }

    #[test]
    fn test_calibrate_once() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client_for(&listener);

        // The server's clock is 5s behind ours.
        let jh = serve_one(listener, |req| {
            let client_ts = req.payload.parse::<f64>().unwrap();
            let ts = now() - 5.0;
            let reply = TimeReply {
                client_ts,
                request_time: ts,
                reply_start: ts,
                reply_time: ts,
            };
            Some(Token::new(Command::Time, "pod-nonce", &reply.encode()))
        });

        client.calibrate(&BTreeMap::new()).unwrap();
        assert_eq!(jh.join().unwrap().command, Command::Time);
        let tp = client.timing().unwrap().clone();
        assert!((tp.local_offset_from_sync - 5.0).abs() < 0.1);
        assert!((tp.xtime_adjustment - tp.controller_basetime - 5.0).abs() < 0.1);
        assert!((client.adjusted_time() - 95.0).abs() < 0.5);

        // The listener is gone, so a second exchange would fail.
        client.calibrate(&BTreeMap::new()).unwrap();
        assert_eq!(client.timing().unwrap(), &tp);
    }

    #[test]
    fn test_calibrate_with_addresses() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client_for(&listener);

        let jh = serve_one(listener, |req| {
            let tnet: cb_intf::TnetRequest = serde_json::from_str(&req.payload).unwrap();
            let ts = now();
            let reply = TimeReply {
                client_ts: tnet.client_ts,
                request_time: ts,
                reply_start: ts,
                reply_time: ts,
            };
            Some(Token::new(Command::Tnet, "pod-nonce", &reply.encode()))
        });

        let mut addrs = BTreeMap::new();
        addrs.insert("server-0".to_string(), "10.0.0.1".to_string());
        client.calibrate(&addrs).unwrap();

        let req = jh.join().unwrap();
        assert_eq!(req.command, Command::Tnet);
        let tnet: cb_intf::TnetRequest = serde_json::from_str(&req.payload).unwrap();
        assert_eq!(tnet.addresses, addrs);
    }

    #[test]
    fn test_sync_synthesizes_token() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client_for(&listener);

        let jh = serve_one(listener, |req| {
            Some(Token::new(Command::Sync, "pod-nonce", &req.payload))
        });
        client.sync_to_controller(None).unwrap();
        let req = jh.join().unwrap();
        assert_eq!(req.command, Command::Sync);
        assert!(req.payload.contains("cb-ns:cb-pod-0:c0"));
    }

    #[test]
    fn test_sync_rejects_foreign_reply() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client_for(&listener);

        let jh = serve_one(listener, |_| Some(Token::new(Command::Sync, "other", "")));
        assert!(client.sync_to_controller(Some("tok")).is_err());
        jh.join().unwrap();
    }

    #[test]
    fn test_sync_fails_on_dropped_reply() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client_for(&listener);

        // A failed round drops held clients without a reply.
        let jh = serve_one(listener, |_| None);
        let err = client.sync_to_controller(Some("tok")).unwrap_err();
        assert!(format!("{:#}", err).contains("connection closed"));
        assert_eq!(jh.join().unwrap().payload, "tok");
    }

    #[test]
    fn test_report_results() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = client_for(&listener);
        assert!(client.report_results(1.0, 2.0, &json!({})).is_err());

        let port = listener.local_addr().unwrap().port();
        let jh = serve_one(listener, |req| {
            let ts = now();
            let reply = TimeReply {
                client_ts: req.payload.parse().unwrap(),
                request_time: ts,
                reply_start: ts,
                reply_time: ts,
            };
            Some(Token::new(Command::Time, "pod-nonce", &reply.encode()))
        });
        client.calibrate(&BTreeMap::new()).unwrap();
        jh.join().unwrap();

        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        let jh = serve_one(listener, |_| Some(Token::new(Command::Rslt, "pod-nonce", "")));
        let extras = Throughput {
            iterations: 4,
            rate: f64::NAN,
            samples: vec![1.5, f64::INFINITY],
        };
        assert_eq!(client.report_results(10.0, 12.5, &extras).unwrap(), 2);

        let req = jh.join().unwrap();
        assert_eq!(req.command, Command::Rslt);
        let v: serde_json::Value = serde_json::from_str(&req.payload).unwrap();
        assert_eq!(v["application"], "clusterbuster-json");
        assert_eq!(v["pod"], "cb-pod-0");
        assert_eq!(v["process_id"], std::process::id());
        assert_eq!(v["data_elapsed_time"], 2.5);
        assert_eq!(v["iterations"], 4);
        assert!(v["rate"].is_null());
        assert_eq!(v["samples"], json!([1.5, null]));
        assert!((v["pod_create_time"].as_f64().unwrap() - 2.0).abs() < 1e-6);
        assert!(v["timing_parameters"]["xtime_adjustment"].is_number());
    }

    #[test]
    fn test_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = client_for(&listener);
        drop(listener);

        let started_at = now();
        assert!(client.sync_to_controller(Some("tok")).is_err());
        assert!(now() - started_at < 5.0);
    }
}
