//! Parameter updates. Optimizers are blind to graph structure: they receive
//! the flat list of (parameter, local learning rate) pairs in stable node
//! order, apply the update, and zero the accumulated gradients.

use serde_json::Value;

use crate::errors::{NetError, NetResult};
use crate::tensor::{CombinedTensor, Tensor};

pub struct ParamRef<'a> {
    pub tensor: &'a mut CombinedTensor,
    pub local_lr: f32,
}

impl<'a> ParamRef<'a> {
    pub fn new(tensor: &'a mut CombinedTensor) -> Self {
        Self {
            tensor,
            local_lr: 1.0,
        }
    }
}

pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Applies one update for iteration `step` and zeroes each delta.
    /// Auxiliary state is keyed by parameter position, which is stable
    /// because node order is stable.
    fn step(&mut self, parameters: &mut [ParamRef<'_>], step: u64) -> NetResult<()>;

    /// Drops auxiliary state (velocities, moments).
    fn reset(&mut self);
}

/// Stochastic gradient descent with momentum, an annealed learning rate
/// `lr / (1 + gamma * t)^exponent`, and L1/L2 penalties.
pub struct SgdOptimizer {
    pub learning_rate: f32,
    pub momentum: f32,
    pub gamma: f32,
    pub exponent: f32,
    pub l1_weight: f32,
    pub l2_weight: f32,
    velocities: Vec<Tensor>,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            gamma: 0.0,
            exponent: 1.0,
            l1_weight: 0.0,
            l2_weight: 0.0,
            velocities: Vec::new(),
        }
    }

    pub fn with_schedule(mut self, gamma: f32, exponent: f32) -> Self {
        self.gamma = gamma;
        self.exponent = exponent;
        self
    }

    pub fn with_regularization(mut self, l1_weight: f32, l2_weight: f32) -> Self {
        self.l1_weight = l1_weight;
        self.l2_weight = l2_weight;
        self
    }

    fn rate_at(&self, step: u64) -> f32 {
        self.learning_rate * (1.0 + self.gamma * step as f32).powf(-self.exponent)
    }
}

impl Optimizer for SgdOptimizer {
    fn name(&self) -> &'static str {
        "gd"
    }

    fn step(&mut self, parameters: &mut [ParamRef<'_>], step: u64) -> NetResult<()> {
        let rate = self.rate_at(step);
        if self.velocities.len() < parameters.len() {
            for parameter in parameters[self.velocities.len()..].iter() {
                self.velocities.push(Tensor::new(parameter.tensor.shape()));
            }
        }

        for (index, parameter) in parameters.iter_mut().enumerate() {
            let velocity = &mut self.velocities[index];
            if velocity.shape() != parameter.tensor.shape() {
                velocity.resize(parameter.tensor.shape());
            }
            let eta = rate * parameter.local_lr;
            let l1 = self.l1_weight;
            let l2 = self.l2_weight;
            let momentum = self.momentum;
            let weights = parameter.tensor.data.as_slice_mut();
            let deltas = parameter.tensor.delta.as_slice_mut();
            for ((w, d), v) in weights
                .iter_mut()
                .zip(deltas.iter_mut())
                .zip(velocity.as_slice_mut())
            {
                let sign = if *w > 0.0 {
                    1.0
                } else if *w < 0.0 {
                    -1.0
                } else {
                    0.0
                };
                let gradient = *d + l1 * sign + l2 * *w;
                *v = momentum * *v - eta * gradient;
                *w += *v;
                *d = 0.0;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.velocities.clear();
    }
}

/// Adam with standard bias correction.
pub struct AdamOptimizer {
    pub step_size: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    first_moments: Vec<Tensor>,
    second_moments: Vec<Tensor>,
}

impl AdamOptimizer {
    pub fn new(step_size: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            step_size,
            beta1,
            beta2,
            epsilon,
            first_moments: Vec::new(),
            second_moments: Vec::new(),
        }
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn step(&mut self, parameters: &mut [ParamRef<'_>], step: u64) -> NetResult<()> {
        while self.first_moments.len() < parameters.len() {
            let shape = parameters[self.first_moments.len()].tensor.shape();
            self.first_moments.push(Tensor::new(shape));
            self.second_moments.push(Tensor::new(shape));
        }

        let t = (step + 1) as f32;
        let correction1 = 1.0 - self.beta1.powf(t);
        let correction2 = 1.0 - self.beta2.powf(t);

        for (index, parameter) in parameters.iter_mut().enumerate() {
            let shape = parameter.tensor.shape();
            if self.first_moments[index].shape() != shape {
                self.first_moments[index].resize(shape);
                self.second_moments[index].resize(shape);
            }
            let alpha = self.step_size * parameter.local_lr;
            let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
            let weights = parameter.tensor.data.as_slice_mut();
            let deltas = parameter.tensor.delta.as_slice_mut();
            for (((w, d), m), v) in weights
                .iter_mut()
                .zip(deltas.iter_mut())
                .zip(self.first_moments[index].as_slice_mut())
                .zip(self.second_moments[index].as_slice_mut())
            {
                let gradient = *d;
                *m = beta1 * *m + (1.0 - beta1) * gradient;
                *v = beta2 * *v + (1.0 - beta2) * gradient * gradient;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *w -= alpha * m_hat / (v_hat.sqrt() + epsilon);
                *d = 0.0;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.first_moments.clear();
        self.second_moments.clear();
    }
}

/// Builds an optimizer from the hyperparameter JSON:
/// `optimization_method` selects "gd" or "adam"; `gd_*` and `ad_*` keys
/// carry the method-specific settings.
pub fn optimizer_from_json(hyperparameters: &Value) -> NetResult<Box<dyn Optimizer>> {
    let method = hyperparameters
        .get("optimization_method")
        .and_then(Value::as_str)
        .unwrap_or("gd");
    let get = |key: &str, default: f32| -> f32 {
        hyperparameters
            .get(key)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    };
    match method {
        "gd" => {
            // Both spellings of the momentum key are in circulation.
            let momentum = get("gd_momentum", get("momentum", 0.0));
            let optimizer = SgdOptimizer::new(get("learning_rate", 0.01), momentum)
                .with_schedule(get("gamma", 0.0), get("exponent", 1.0))
                .with_regularization(get("l1_weight", 0.0), get("l2_weight", 0.0));
            Ok(Box::new(optimizer))
        }
        "adam" => Ok(Box::new(AdamOptimizer::new(
            get("ad_step_size", 0.001),
            get("ad_beta1", 0.9),
            get("ad_beta2", 0.999),
            get("ad_epsilon", 1e-8),
        ))),
        other => Err(NetError::Config(format!(
            "unknown optimization method '{other}'"
        ))),
    }
}
