// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use cb_util::*;

/// Controller clock readings bracketing a read of the sync host's clock,
/// written by the controller before the sync service starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerTimestamps {
    pub first_controller_ts: f64,
    pub sync_ts: f64,
    pub second_controller_ts: f64,
}

impl JsonLoad for ControllerTimestamps {
    fn loaded(&mut self) -> Result<()> {
        if self.second_controller_ts < self.first_controller_ts {
            bail!(
                "second_controller_ts {} precedes first_controller_ts {}",
                self.second_controller_ts,
                self.first_controller_ts
            );
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerTiming {
    pub first_controller_ts: f64,
    pub sync_ts: f64,
    pub second_controller_ts: f64,
    pub controller_rtt: f64,
    /// Sync host clock minus controller clock, assuming the sync host read
    /// its clock halfway through the controller's round trip.
    pub sync_offset_from_controller: f64,
}

impl From<ControllerTimestamps> for ControllerTiming {
    fn from(ts: ControllerTimestamps) -> Self {
        Self {
            first_controller_ts: ts.first_controller_ts,
            sync_ts: ts.sync_ts,
            second_controller_ts: ts.second_controller_ts,
            controller_rtt: ts.second_controller_ts - ts.first_controller_ts,
            sync_offset_from_controller: ts.sync_ts
                - (ts.first_controller_ts + ts.second_controller_ts) / 2.0,
        }
    }
}

/// The sync service's answer to a `time`/`tnet` request. All values except
/// `client_ts` are on the reference clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeReply {
    pub client_ts: f64,
    pub request_time: f64,
    pub reply_start: f64,
    pub reply_time: f64,
}

impl TimeReply {
    pub fn encode(&self) -> String {
        format!(
            "{} {} {} {}",
            self.client_ts, self.request_time, self.reply_start, self.reply_time
        )
    }

    pub fn parse(input: &str) -> Result<Self> {
        let vals = input
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .with_context(|| format!("invalid time reply {:?}", input))?;
        if vals.len() != 4 {
            bail!("time reply has {} fields instead of 4", vals.len());
        }
        Ok(Self {
            client_ts: vals[0],
            request_time: vals[1],
            reply_start: vals[2],
            reply_time: vals[3],
        })
    }
}

/// Payload of a `tnet` request: a `time` request that also announces the
/// sender's addresses to the nameserver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TnetRequest {
    pub client_ts: f64,
    #[serde(default)]
    pub addresses: BTreeMap<String, String>,
}

/// Parse the client timestamp out of a `time` payload.
pub fn parse_time_request(payload: &str) -> Result<f64> {
    Ok(payload
        .trim()
        .parse::<f64>()
        .with_context(|| format!("invalid time request {:?}", payload))?)
}

/// Per-process clock calibration, attached to every result report.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingParameters {
    pub controller_basetime: f64,
    pub controller_crtime: f64,
    pub start_time: f64,
    pub local_sync_start: f64,
    pub remote_sync_start: f64,
    pub local_sync: f64,
    pub remote_sync: f64,
    pub local_sync_rtt: f64,
    pub remote_sync_rtt: f64,
    pub local_offset_from_sync: f64,
    pub xtime_adjustment: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_reply() {
        let reply = TimeReply {
            client_ts: 1700000000.123456,
            request_time: 1700000000.5,
            reply_start: 1700000001.0,
            reply_time: 1700000001.000001,
        };
        assert_eq!(TimeReply::parse(&reply.encode()).unwrap(), reply);
        assert!(TimeReply::parse("1 2 3").is_err());
        assert!(TimeReply::parse("1 2 3 x").is_err());
    }

    #[test]
    fn test_controller_timing() {
        let timing = ControllerTiming::from(ControllerTimestamps {
            first_controller_ts: 100.0,
            sync_ts: 106.0,
            second_controller_ts: 102.0,
        });
        assert_eq!(timing.controller_rtt, 2.0);
        assert_eq!(timing.sync_offset_from_controller, 5.0);
    }

    #[test]
    fn test_tnet_request() {
        let req: TnetRequest = serde_json::from_str("{\"client_ts\": 1.5}").unwrap();
        assert_eq!(req.client_ts, 1.5);
        assert!(req.addresses.is_empty());
        assert_eq!(parse_time_request(" 2.25 ").unwrap(), 2.25);
        assert!(parse_time_request("").is_err());
    }
}
