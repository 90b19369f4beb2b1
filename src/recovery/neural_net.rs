// =============================================================================
// Neural Recovery Net — spec §4.12
// =============================================================================
//
// 8 inputs -> 16 hidden (ReLU) -> 8 hidden (ReLU) -> 4 outputs (Sigmoid).
// Weight storage is flat row-major (w1[i*H1+j]); backprop is written in
// explicit loops, not through a framework, per design note §9.
// =============================================================================

use rand::Rng;
use serde::{Deserialize, Serialize};

const INPUTS: usize = 8;
const H1: usize = 16;
const H2: usize = 8;
const OUTPUTS: usize = 4;

const MIN_TRAINING_EPISODES: u32 = 3;
const INITIAL_LR: f64 = 0.01;
const LR_DECAY: f64 = 0.999;
const MIN_LR: f64 = 0.0001;

/// Clamp sigmoid input to keep `exp` finite (spec: "sigmoid clamps input to
/// ±15 before exp; final outputs are guaranteed finite").
fn sigmoid(x: f64) -> f64 {
    let clamped = x.clamp(-15.0, 15.0);
    1.0 / (1.0 + (-clamped).exp())
}

fn sigmoid_derivative_from_output(s: f64) -> f64 {
    s * (1.0 - s)
}

fn relu(x: f64) -> f64 {
    x.max(0.0)
}

fn relu_derivative(pre_activation: f64) -> f64 {
    if pre_activation > 0.0 {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutputs {
    pub stake_multiplier: f64,
    pub precision_threshold: f64,
    pub confidence_boost: f64,
    pub aggressiveness: f64,
}

impl RecoveryOutputs {
    fn default_params() -> Self {
        Self {
            stake_multiplier: 1.0,
            precision_threshold: 0.75,
            confidence_boost: 0.1,
            aggressiveness: 0.3,
        }
    }

    fn from_raw(raw: &[f64; OUTPUTS]) -> Self {
        Self {
            stake_multiplier: 0.5 + raw[0] * 1.5,
            precision_threshold: 0.6 + raw[1] * 0.35,
            confidence_boost: raw[2] * 0.35,
            aggressiveness: raw[3],
        }
    }

    fn to_normalized(&self) -> [f64; OUTPUTS] {
        [
            ((self.stake_multiplier - 0.5) / 1.5).clamp(0.0, 1.0),
            ((self.precision_threshold - 0.6) / 0.35).clamp(0.0, 1.0),
            (self.confidence_boost / 0.35).clamp(0.0, 1.0),
            self.aggressiveness.clamp(0.0, 1.0),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralWeights {
    pub w1: Vec<f64>,
    pub b1: Vec<f64>,
    pub w2: Vec<f64>,
    pub b2: Vec<f64>,
    pub w3: Vec<f64>,
    pub b3: Vec<f64>,
    pub iterations: u32,
    pub last_trained_at: Option<i64>,
}

fn xavier_uniform(fan_in: usize, fan_out: usize, count: usize) -> Vec<f64> {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let mut rng = rand::thread_rng();
    (0..count).map(|_| rng.gen_range(-bound..=bound)).collect()
}

impl NeuralWeights {
    pub fn init_random() -> Self {
        Self {
            w1: xavier_uniform(INPUTS, H1, INPUTS * H1),
            b1: vec![0.0; H1],
            w2: xavier_uniform(H1, H2, H1 * H2),
            b2: vec![0.0; H2],
            w3: xavier_uniform(H2, OUTPUTS, H2 * OUTPUTS),
            b3: vec![0.0; OUTPUTS],
            iterations: 0,
            last_trained_at: None,
        }
    }

    fn shape_matches(&self) -> bool {
        self.w1.len() == INPUTS * H1
            && self.b1.len() == H1
            && self.w2.len() == H1 * H2
            && self.b2.len() == H2
            && self.w3.len() == H2 * OUTPUTS
            && self.b3.len() == OUTPUTS
    }

    /// Rejects payloads whose flat array lengths don't match the exact layer
    /// shapes; on mismatch, reinitializes fresh weights rather than loading.
    pub fn deserialize_or_reset(value: serde_json::Value) -> Self {
        match serde_json::from_value::<NeuralWeights>(value) {
            Ok(weights) if weights.shape_matches() => weights,
            _ => Self::init_random(),
        }
    }
}

struct ForwardPass {
    hidden1_pre: [f64; H1],
    hidden1: [f64; H1],
    hidden2_pre: [f64; H2],
    hidden2: [f64; H2],
    output: [f64; OUTPUTS],
}

fn forward(weights: &NeuralWeights, input: &[f64; INPUTS]) -> ForwardPass {
    let mut hidden1_pre = [0.0; H1];
    let mut hidden1 = [0.0; H1];
    for j in 0..H1 {
        let mut sum = weights.b1[j];
        for i in 0..INPUTS {
            sum += input[i] * weights.w1[i * H1 + j];
        }
        hidden1_pre[j] = sum;
        hidden1[j] = relu(sum);
    }

    let mut hidden2_pre = [0.0; H2];
    let mut hidden2 = [0.0; H2];
    for j in 0..H2 {
        let mut sum = weights.b2[j];
        for i in 0..H1 {
            sum += hidden1[i] * weights.w2[i * H2 + j];
        }
        hidden2_pre[j] = sum;
        hidden2[j] = relu(sum);
    }

    let mut output = [0.0; OUTPUTS];
    for j in 0..OUTPUTS {
        let mut sum = weights.b3[j];
        for i in 0..H2 {
            sum += hidden2[i] * weights.w3[i * OUTPUTS + j];
        }
        output[j] = sigmoid(sum);
    }

    ForwardPass {
        hidden1_pre,
        hidden1,
        hidden2_pre,
        hidden2,
        output,
    }
}

pub struct NeuralRecoveryNet {
    weights: NeuralWeights,
}

impl NeuralRecoveryNet {
    pub fn new(weights: NeuralWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &NeuralWeights {
        &self.weights
    }

    pub fn predict(&self, input: &[f64; INPUTS]) -> RecoveryOutputs {
        if self.weights.iterations < MIN_TRAINING_EPISODES {
            return RecoveryOutputs::default_params();
        }
        let pass = forward(&self.weights, input);
        RecoveryOutputs::from_raw(&pass.output)
    }

    /// One online SGD step per completed episode.
    pub fn train(&mut self, input: &[f64; INPUTS], reward: f64) {
        let reward = reward.clamp(0.0, 1.0);
        let lr = (INITIAL_LR * LR_DECAY.powi(self.weights.iterations as i32)).max(MIN_LR);

        let pass = forward(&self.weights, input);
        let default_normalized = RecoveryOutputs::default_params().to_normalized();
        let actual_normalized = RecoveryOutputs::from_raw(&pass.output).to_normalized();

        let mut target = [0.0; OUTPUTS];
        for i in 0..OUTPUTS {
            target[i] = default_normalized[i] + reward * (actual_normalized[i] - default_normalized[i]);
        }

        let mut output_delta = [0.0; OUTPUTS];
        for i in 0..OUTPUTS {
            output_delta[i] = (target[i] - pass.output[i]) * sigmoid_derivative_from_output(pass.output[i]);
        }

        let mut hidden2_delta = [0.0; H2];
        for i in 0..H2 {
            let mut sum = 0.0;
            for j in 0..OUTPUTS {
                sum += output_delta[j] * self.weights.w3[i * OUTPUTS + j];
            }
            hidden2_delta[i] = sum * relu_derivative(pass.hidden2_pre[i]);
        }

        let mut hidden1_delta = [0.0; H1];
        for i in 0..H1 {
            let mut sum = 0.0;
            for j in 0..H2 {
                sum += hidden2_delta[j] * self.weights.w2[i * H2 + j];
            }
            hidden1_delta[i] = sum * relu_derivative(pass.hidden1_pre[i]);
        }

        for i in 0..H2 {
            for j in 0..OUTPUTS {
                self.weights.w3[i * OUTPUTS + j] += lr * output_delta[j] * pass.hidden2[i];
            }
        }
        for j in 0..OUTPUTS {
            self.weights.b3[j] += lr * output_delta[j];
        }

        for i in 0..H1 {
            for j in 0..H2 {
                self.weights.w2[i * H2 + j] += lr * hidden2_delta[j] * pass.hidden1[i];
            }
        }
        for j in 0..H2 {
            self.weights.b2[j] += lr * hidden2_delta[j];
        }

        for i in 0..INPUTS {
            for j in 0..H1 {
                self.weights.w1[i * H1 + j] += lr * hidden1_delta[j] * input[i];
            }
        }
        for j in 0..H1 {
            self.weights.b1[j] += lr * hidden1_delta[j];
        }

        self.weights.iterations += 1;
        self.weights.last_trained_at = Some(chrono::Utc::now().timestamp_millis());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predict_before_min_episodes_returns_defaults() {
        let net = NeuralRecoveryNet::new(NeuralWeights::init_random());
        let out = net.predict(&[0.0; INPUTS]);
        let defaults = RecoveryOutputs::default_params();
        assert_eq!(out.stake_multiplier, defaults.stake_multiplier);
    }

    #[test]
    fn train_increments_iterations_and_stays_finite() {
        let mut net = NeuralRecoveryNet::new(NeuralWeights::init_random());
        let input = [0.1, -0.2, 0.3, 0.4, -0.5, 0.6, 0.0, 1.0];
        for _ in 0..5 {
            net.train(&input, 0.8);
        }
        assert_eq!(net.weights().iterations, 5);
        let out = net.predict(&input);
        assert!(out.stake_multiplier.is_finite());
        assert!(out.aggressiveness.is_finite());
    }

    #[test]
    fn zero_features_and_extreme_sigmoid_stay_finite() {
        let net = NeuralRecoveryNet::new(NeuralWeights {
            iterations: 10,
            ..NeuralWeights::init_random()
        });
        let out = net.predict(&[0.0; INPUTS]);
        assert!(out.stake_multiplier.is_finite());
        assert!(sigmoid(100.0).is_finite());
        assert!(sigmoid(100.0) <= 1.0);
        assert!(sigmoid(-100.0) >= 0.0);
    }

    #[test]
    fn serialize_reset_load_predict_round_trips_bit_identical() {
        let mut net = NeuralRecoveryNet::new(NeuralWeights::init_random());
        let input = [0.1; INPUTS];
        for _ in 0..5 {
            net.train(&input, 0.5);
        }
        let before = net.predict(&input);

        let serialized = serde_json::to_value(net.weights()).unwrap();
        let reloaded = NeuralWeights::deserialize_or_reset(serialized);
        let reloaded_net = NeuralRecoveryNet::new(reloaded);
        let after = reloaded_net.predict(&input);

        assert_eq!(before.stake_multiplier, after.stake_multiplier);
        assert_eq!(before.aggressiveness, after.aggressiveness);
    }

    #[test]
    fn shape_mismatch_reinitializes() {
        let bad = serde_json::json!({
            "w1": [1.0, 2.0],
            "b1": [0.0],
            "w2": [],
            "b2": [],
            "w3": [],
            "b3": [],
            "iterations": 0,
            "last_trained_at": null
        });
        let weights = NeuralWeights::deserialize_or_reset(bad);
        assert!(weights.shape_matches());
    }
}
