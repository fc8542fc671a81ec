// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Payload of an `nsrq` token sent to the nameserver. `have` announces
/// name to address mappings, `rqst` asks for the addresses of the listed
/// names. The reply to a request is the `BTreeMap<String, String>` of all
/// requested names.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NsMessage {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub have: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub rqst: BTreeSet<String>,
}

impl NsMessage {
    pub fn have(have: BTreeMap<String, String>) -> Self {
        Self {
            have,
            rqst: Default::default(),
        }
    }

    pub fn rqst<I: IntoIterator<Item = String>>(names: I) -> Self {
        Self {
            have: Default::default(),
            rqst: names.into_iter().collect(),
        }
    }
}

pub type NsReply = BTreeMap<String, String>;
