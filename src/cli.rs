use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Hash verification policy applied after a file is merged.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Verify only when the manifest carries a hash.
    #[default]
    Auto,
    /// Every file must carry a hash.
    On,
    Off,
}
