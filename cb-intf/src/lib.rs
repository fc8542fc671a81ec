// Copyright (c) Facebook, Inc. and its affiliates.
pub mod nameserver;
pub mod pod_args;
pub mod report;
pub mod sync_args;
pub mod timing;
pub mod token;

pub use nameserver::{NsMessage, NsReply};
pub use pod_args::PodArgs;
pub use report::{SyncResult, WorkerResult, RESULT_APPLICATION};
pub use sync_args::SyncArgs;
pub use timing::{
    parse_time_request, ControllerTimestamps, ControllerTiming, TimeReply, TimingParameters,
    TnetRequest,
};
pub use token::{read_token, write_token, Command, Token, TokenError};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}
