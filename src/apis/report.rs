//! Wire format of the direct-report channel

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::features::Features;

/// Labels and features sent by a reporting agent for its own node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLabelsRequest {
    pub node_name: String,

    #[serde(default)]
    pub reporter_version: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub features: Features,
}
