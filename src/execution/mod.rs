pub mod engine;
pub mod fast_path;
pub mod latency;

pub use fast_path::{FastPathResult, FastPathTrade};
pub use latency::LatencyTrace;
