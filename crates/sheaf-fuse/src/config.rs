//! Pass configuration.

use serde::{Deserialize, Serialize};

use sheaf_graph::ReduceKind;

use crate::error::FuseError;

/// Options shared by every fusion strategy.
///
/// `fusion_length` is overloaded the same way across the strategy family:
/// the count strategies read it as elements-per-group, the just-in-time
/// strategy reads it as a byte budget in MiB.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionOptions {
    /// Elements per fused group, or MiB of gradient bytes for the
    /// just-in-time strategy. Must be at least 2.
    pub fusion_length: usize,
    /// Staging buffers cycled by the ring-buffer strategy.
    pub ring_buffers: usize,
    /// Reduction kind every scanned collective must carry.
    pub reduce: ReduceKind,
}

impl Default for FusionOptions {
    fn default() -> Self {
        FusionOptions {
            fusion_length: 2,
            ring_buffers: 2,
            reduce: ReduceKind::Sum,
        }
    }
}

impl FusionOptions {
    pub fn with_fusion_length(mut self, fusion_length: usize) -> Self {
        self.fusion_length = fusion_length;
        self
    }

    pub fn with_ring_buffers(mut self, ring_buffers: usize) -> Self {
        self.ring_buffers = ring_buffers;
        self
    }

    pub fn with_reduce(mut self, reduce: ReduceKind) -> Self {
        self.reduce = reduce;
        self
    }

    /// Rejects option sets no strategy can run with. Checked by the driver
    /// before the graph is touched.
    pub fn validate(&self) -> Result<(), FuseError> {
        if self.fusion_length < 2 {
            return Err(FuseError::InvalidConfiguration(format!(
                "fusion_length must be at least 2, got {}",
                self.fusion_length
            )));
        }
        if self.ring_buffers == 0 {
            return Err(FuseError::InvalidConfiguration(
                "ring_buffers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        FusionOptions::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_lengths() {
        for bad in [0, 1] {
            let err = FusionOptions::default()
                .with_fusion_length(bad)
                .validate()
                .unwrap_err();
            assert!(matches!(err, FuseError::InvalidConfiguration(_)));
        }
        let err = FusionOptions::default()
            .with_ring_buffers(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, FuseError::InvalidConfiguration(_)));
    }

    #[test]
    fn round_trips_through_serde() {
        let options = FusionOptions::default()
            .with_fusion_length(8)
            .with_reduce(ReduceKind::Mean);
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(serde_json::from_str::<FusionOptions>(&json).unwrap(), options);
    }
}
