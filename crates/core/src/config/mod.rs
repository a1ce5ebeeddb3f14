use serde::{Deserialize, Serialize};

/// Default bin capacity preallocated per snapshot slot.
///
/// Spectrum taps commonly publish 32 to 256 bins; sizing for the top of that
/// range keeps in-capacity shape changes allocation-free.
pub const DEFAULT_BIN_CAPACITY: usize = 256;

/// Configuration for a bridge instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Number of f32 bins each snapshot slot reserves up front. Writes with
    /// a larger bin count still work but grow each slot once.
    pub bin_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bin_capacity: DEFAULT_BIN_CAPACITY,
        }
    }
}
