pub mod engine;
pub mod neural_net;

pub use engine::{RecoveryEngine, RecoveryMode, RecoveryPolicy, RecoveryState, TradeOutcomeContext};
pub use neural_net::{NeuralRecoveryNet, NeuralWeights, RecoveryOutputs};
