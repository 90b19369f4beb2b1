pub mod detector;
pub mod features;

pub use detector::{MarketRegime, RegimeDetector, RegimeState};
pub use features::FeatureSnapshot;
