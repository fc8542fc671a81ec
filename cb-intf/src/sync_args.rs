// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use clap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use cb_util::*;

const HELP_BODY: &str = "\
ClusterBuster sync service.

cb-sync holds back the workers of one clusterbuster job at a series of
barriers so that they start and stop each phase together. The first round
waits for INITIAL_EXPECTED_CLIENTS connections, every following round for
EXPECTED_CLIENTS. A round of results ends the job.

Workers calibrate their clocks against this service during the first round.
Timestamps handed out are on the controller's clock, derived from
CONTROLLER_TIMESTAMP_FILE which is consumed and deleted at startup.

At the end, results are written to SYNC_FILE. On failure, the message is
written to ERROR_FILE. In both cases the service waits for the controller to
remove the file before exiting.
";

lazy_static! {
    static ref ARGS_STR: String = format!(
        "<NONCE>                     'Shared secret identifying this job'
         <SYNC_FILE>                 'Result file handed to the controller'
         <ERROR_FILE>                'Failure file handed to the controller'
         <CONTROLLER_TIMESTAMP_FILE> 'Controller clock readings, deleted once read'
         <PREDELAY>                  'Delay after the first round'
         <POSTDELAY>                 'Delay after the last round'
         <STEP_INTERVAL>             'Delay applied to every sync round'
         <LISTEN_PORT>               'Port to accept sync connections on'
         <NAMESERVER_PORT>           'Port the nameserver listens on'
         <EXPECTED_CLIENTS>          'Number of clients in each round'
         <INITIAL_EXPECTED_CLIENTS>  'Number of clients in the first round, 0 for EXPECTED_CLIENTS'
         -a, --args=[FILE]           'Load base command line arguments from FILE'
             --sentinel-dir=[DIR]    'Directory for started/finished sentinels (default: {dfl_sentinel_dir})'
             --round-timeout=[SECS]  'Fail a round not completed within SECS, 0 to wait forever (default: {dfl_round_timeout})'
             --poll-interval=[SECS]  'Interval for polling handoff files (default: {dfl_poll_interval})'
         -v...                       'Sets the level of verbosity'",
        dfl_sentinel_dir = SyncArgs::default().sentinel_dir,
        dfl_round_timeout = SyncArgs::default().round_timeout,
        dfl_poll_interval = SyncArgs::default().poll_interval,
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncArgs {
    pub sentinel_dir: String,
    pub round_timeout: u32,
    pub poll_interval: f64,

    #[serde(skip)]
    pub nonce: String,
    #[serde(skip)]
    pub sync_file: String,
    #[serde(skip)]
    pub error_file: String,
    #[serde(skip)]
    pub controller_timestamp_file: String,
    #[serde(skip)]
    pub predelay: f64,
    #[serde(skip)]
    pub postdelay: f64,
    #[serde(skip)]
    pub step_interval: f64,
    #[serde(skip)]
    pub listen_port: u16,
    #[serde(skip)]
    pub nameserver_port: u16,
    #[serde(skip)]
    pub expected_clients: u32,
    #[serde(skip)]
    pub initial_expected_clients: u32,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for SyncArgs {
    fn default() -> Self {
        Self {
            sentinel_dir: DFL_SENTINEL_DIR.into(),
            round_timeout: 0,
            poll_interval: 1.0,
            nonce: "".into(),
            sync_file: "".into(),
            error_file: "".into(),
            controller_timestamp_file: "".into(),
            predelay: 0.0,
            postdelay: 0.0,
            step_interval: 0.0,
            listen_port: 7778,
            nameserver_port: 7779,
            expected_clients: 1,
            initial_expected_clients: 1,
            verbosity: 0,
        }
    }
}

impl SyncArgs {
    pub fn validate(&self) -> Result<()> {
        if self.nonce.is_empty() || self.nonce.contains(char::is_whitespace) {
            bail!("nonce must be non-empty and free of whitespace");
        }
        if self.expected_clients == 0 {
            bail!("EXPECTED_CLIENTS must be positive");
        }
        if self.listen_port == self.nameserver_port {
            bail!(
                "LISTEN_PORT and NAMESERVER_PORT must differ ({})",
                self.listen_port
            );
        }
        if !(self.poll_interval > 0.0) {
            bail!("--poll-interval must be positive");
        }
        Ok(())
    }
}

impl JsonLoad for SyncArgs {}
impl JsonSave for SyncArgs {}

fn parse_positional<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let v = matches.value_of(name).unwrap_or("");
    Ok(v.trim()
        .parse::<T>()
        .with_context(|| format!("invalid {} {:?}", name, v))?)
}

fn parse_delay(matches: &clap::ArgMatches, name: &str) -> Result<f64> {
    parse_duration(matches.value_of(name).unwrap_or("0"))
        .with_context(|| format!("invalid {}", name))
}

impl JsonArgs for SyncArgs {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        clap::App::new("cb-sync")
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
        let dfl = SyncArgs::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("sentinel-dir") {
            self.sentinel_dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.sentinel_dir.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("round-timeout") {
            self.round_timeout = if v.len() > 0 {
                parse_duration(v)?.ceil() as u32
            } else {
                dfl.round_timeout
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("poll-interval") {
            self.poll_interval = if v.len() > 0 {
                parse_duration(v)?
            } else {
                dfl.poll_interval
            };
            updated_base = true;
        }

        self.nonce = matches.value_of("NONCE").unwrap_or("").to_string();
        self.sync_file = matches.value_of("SYNC_FILE").unwrap_or("").to_string();
        self.error_file = matches.value_of("ERROR_FILE").unwrap_or("").to_string();
        self.controller_timestamp_file = matches
            .value_of("CONTROLLER_TIMESTAMP_FILE")
            .unwrap_or("")
            .to_string();
        self.predelay = parse_delay(matches, "PREDELAY")?;
        self.postdelay = parse_delay(matches, "POSTDELAY")?;
        self.step_interval = parse_delay(matches, "STEP_INTERVAL")?;
        self.listen_port = parse_positional(matches, "LISTEN_PORT")?;
        self.nameserver_port = parse_positional(matches, "NAMESERVER_PORT")?;
        self.expected_clients = parse_positional(matches, "EXPECTED_CLIENTS")?;
        self.initial_expected_clients =
            match parse_positional::<u32>(matches, "INITIAL_EXPECTED_CLIENTS")? {
                0 => self.expected_clients,
                v => v,
            };
        self.verbosity = Self::verbosity(matches);

        self.validate()?;
        Ok(updated_base)
    }
}
