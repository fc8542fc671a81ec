// Copyright (c) Facebook, Inc. and its affiliates.

//! Clock offset estimation from a single `time` exchange.
//!
//! The sync service stamps the request when it accepts the connection
//! (`request_time`) and again right before writing the reply
//! (`reply_time`), both on the controller's clock. Assuming the request
//! and reply legs take equally long, the local clock's offset from the
//! controller's is the difference between the local and remote receive
//! times minus half of the time spent on the wire.
use cb_intf::{TimeReply, TimingParameters};

/// Where the controller's clock stands relative to ours.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockSample {
    pub local_sync_start: f64,
    pub local_sync: f64,
    pub remote_sync_start: f64,
    pub remote_sync: f64,
}

impl ClockSample {
    pub fn new(local_sync_start: f64, local_sync: f64, reply: &TimeReply) -> Self {
        Self {
            local_sync_start,
            local_sync,
            remote_sync_start: reply.request_time,
            remote_sync: reply.reply_time,
        }
    }

    pub fn local_rtt(&self) -> f64 {
        self.local_sync - self.local_sync_start
    }

    pub fn remote_rtt(&self) -> f64 {
        self.remote_sync - self.remote_sync_start
    }

    /// Local clock minus controller clock.
    pub fn offset(&self) -> f64 {
        (self.local_sync - self.remote_sync) - (self.local_rtt() - self.remote_rtt()) / 2.0
    }
}

pub fn timing_parameters(
    controller_basetime: f64,
    controller_crtime: f64,
    start_time: f64,
    sample: &ClockSample,
) -> TimingParameters {
    let offset = sample.offset();
    TimingParameters {
        controller_basetime,
        controller_crtime,
        start_time,
        local_sync_start: sample.local_sync_start,
        remote_sync_start: sample.remote_sync_start,
        local_sync: sample.local_sync,
        remote_sync: sample.remote_sync,
        local_sync_rtt: sample.local_rtt(),
        remote_sync_rtt: sample.remote_rtt(),
        local_offset_from_sync: offset,
        xtime_adjustment: controller_basetime + offset,
    }
}
