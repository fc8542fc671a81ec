// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use clap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use cb_util::*;

const HELP_BODY: &str = "\
ClusterBuster pod client.

cb-pod runs a workload in PROCESSES worker processes and coordinates it with
the cb-sync service of the job. The clock of the pod is calibrated against the
sync service once at startup so that all reported times are relative to the
controller's BASETIME.

When running as pid 1 of a container, cb-pod additionally reaps orphaned
processes.
";

lazy_static! {
    static ref ARGS_STR: String = format!(
        "-H, --sync-host=[HOST]         'Host running the sync service (default: {dfl_sync_host})'
         -p, --sync-port=[PORT]         'Sync service port (default: {dfl_sync_port})'
         -n, --ns-port=[PORT]           'Nameserver port (default: {dfl_ns_port})'
         -N, --nonce=[NONCE]            'Shared secret of the job'
         -b, --basetime=[TIME]          'Controller base time of the job'
         -c, --crtime=[TIME]            'Controller time at which the pod was created'
             --namespace=[NAME]         'Namespace of the pod'
             --pod=[NAME]               'Name of the pod'
             --container=[NAME]         'Name of the container'
         -P, --processes=[NR]           'Number of worker processes (default: {dfl_processes})'
         -t, --connect-timeout=[SECS]   'Give up connecting after SECS, 0 to retry forever (default: 0)'
         -w, --workload=[NAME]          'Workload to run, synctest or sleep (default: {dfl_workload})'
         -i, --iterations=[NR]          'Workload iterations (default: {dfl_iterations})'
         -I, --interval=[SECS]          'Delay between workload steps (default: {dfl_interval})'
             --announce=[NAME=ADDR,...] 'Announce addresses to the nameserver during calibration'
             --sentinel-dir=[DIR]       'Directory for started/finished sentinels (default: {dfl_sentinel_dir})'
         -a, --args=[FILE]              'Load base command line arguments from FILE'
         -v...                          'Sets the level of verbosity'",
        dfl_sync_host = PodArgs::default().sync_host,
        dfl_sync_port = PodArgs::default().sync_port,
        dfl_ns_port = PodArgs::default().ns_port,
        dfl_processes = PodArgs::default().processes,
        dfl_workload = PodArgs::default().workload,
        dfl_iterations = PodArgs::default().iterations,
        dfl_interval = PodArgs::default().interval,
        dfl_sentinel_dir = PodArgs::default().sentinel_dir,
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodArgs {
    pub sync_host: String,
    pub sync_port: u16,
    pub ns_port: u16,
    pub processes: u32,
    pub connect_timeout: f64,
    pub workload: String,
    pub iterations: u32,
    pub interval: f64,
    pub sentinel_dir: String,

    #[serde(skip)]
    pub nonce: String,
    #[serde(skip)]
    pub basetime: f64,
    #[serde(skip)]
    pub crtime: f64,
    #[serde(skip)]
    pub namespace: String,
    #[serde(skip)]
    pub pod: String,
    #[serde(skip)]
    pub container: String,
    #[serde(skip)]
    pub announce: Vec<(String, String)>,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for PodArgs {
    fn default() -> Self {
        Self {
            sync_host: "sync".into(),
            sync_port: 7778,
            ns_port: 7779,
            processes: 1,
            connect_timeout: 0.0,
            workload: "synctest".into(),
            iterations: 10,
            interval: 0.0,
            sentinel_dir: DFL_SENTINEL_DIR.into(),
            nonce: "".into(),
            basetime: 0.0,
            crtime: 0.0,
            namespace: "".into(),
            pod: "".into(),
            container: "".into(),
            announce: vec![],
            verbosity: 0,
        }
    }
}

impl JsonLoad for PodArgs {}
impl JsonSave for PodArgs {}

fn parse_announce(input: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = vec![];
    for tok in input.split(',').map(|x| x.trim()).filter(|x| x.len() > 0) {
        match tok.split_once('=') {
            Some((name, addr)) if name.len() > 0 && addr.len() > 0 => {
                pairs.push((name.to_string(), addr.to_string()))
            }
            _ => bail!("invalid announcement {:?}, expected NAME=ADDR", tok),
        }
    }
    Ok(pairs)
}

fn parse_f64(v: &str, what: &str) -> Result<f64> {
    Ok(v.trim()
        .parse::<f64>()
        .with_context(|| format!("invalid {} {:?}", what, v))?)
}

impl JsonArgs for PodArgs {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("cb-pod")
            .version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        let dfl = PodArgs::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("sync-host") {
            self.sync_host = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.sync_host.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("sync-port") {
            self.sync_port = if v.len() > 0 {
                v.parse::<u16>()
                    .with_context(|| format!("invalid sync port {:?}", v))?
            } else {
                dfl.sync_port
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("ns-port") {
            self.ns_port = if v.len() > 0 {
                v.parse::<u16>()
                    .with_context(|| format!("invalid nameserver port {:?}", v))?
            } else {
                dfl.ns_port
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("processes") {
            self.processes = if v.len() > 0 {
                v.parse::<u32>()
                    .with_context(|| format!("invalid process count {:?}", v))?
                    .max(1)
            } else {
                dfl.processes
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("connect-timeout") {
            self.connect_timeout = if v.len() > 0 {
                parse_duration(v)?
            } else {
                dfl.connect_timeout
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("workload") {
            self.workload = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.workload.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("iterations") {
            self.iterations = if v.len() > 0 {
                v.parse::<u32>()
                    .with_context(|| format!("invalid iteration count {:?}", v))?
            } else {
                dfl.iterations
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("interval") {
            self.interval = if v.len() > 0 {
                parse_duration(v)?
            } else {
                dfl.interval
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("sentinel-dir") {
            self.sentinel_dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.sentinel_dir.clone()
            };
            updated_base = true;
        }

        self.nonce = matches.value_of("nonce").unwrap_or("").to_string();
        if self.nonce.is_empty() || self.nonce.contains(char::is_whitespace) {
            bail!("--nonce must be given and free of whitespace");
        }
        if let Some(v) = matches.value_of("basetime") {
            self.basetime = parse_f64(v, "basetime")?;
        }
        self.crtime = match matches.value_of("crtime") {
            Some(v) => parse_f64(v, "crtime")?,
            None => self.basetime,
        };
        self.namespace = matches.value_of("namespace").unwrap_or("").to_string();
        self.pod = match matches.value_of("pod") {
            Some(v) => v.to_string(),
            None => std::env::var("HOSTNAME").unwrap_or_default(),
        };
        self.container = matches.value_of("container").unwrap_or("").to_string();
        if let Some(v) = matches.value_of("announce") {
            self.announce = parse_announce(v)?;
        }
        self.verbosity = Self::verbosity(matches);

        Ok(updated_base)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_parse_announce() {
        let pairs = super::parse_announce("server-0=10.0.0.1, server-1=10.0.0.2").unwrap();
        assert_eq!(
            pairs,
            vec![
                ("server-0".to_string(), "10.0.0.1".to_string()),
                ("server-1".to_string(), "10.0.0.2".to_string())
            ]
        );
        assert!(super::parse_announce("server-0").is_err());
        assert!(super::parse_announce("=10.0.0.1").is_err());
        assert!(super::parse_announce("").unwrap().is_empty());
    }
}
