use oxidenet::optim::{optimizer_from_json, AdamOptimizer, Optimizer, ParamRef, SgdOptimizer};
use oxidenet::tensor::CombinedTensor;
use serde_json::json;

/// Minimizes f(x, y, z) = (x-7)^2 + 0.2 (y+1)^2 + 3 (z-11.5)^2 from the
/// origin and checks the iterate lands near (7, -1, 11.5) while a second,
/// zero-gradient parameter stays untouched.
fn check_quadratic_convergence(optimizer: &mut dyn Optimizer) {
    let mut parameter = CombinedTensor::from_dims(1, 1, 1, 3);
    let mut unrelated = CombinedTensor::from_dims(1, 1, 1, 15);

    let mut reached_minimum = false;
    for step in 0..10_000 {
        {
            let x = parameter.data.as_slice();
            let delta = parameter.delta.as_slice_mut();
            delta[0] = 2.0 * (x[0] - 7.0);
            delta[1] = 0.4 * (x[1] + 1.0);
            delta[2] = 6.0 * (x[2] - 11.5);
        }

        let mut params = [
            ParamRef::new(&mut parameter),
            ParamRef::new(&mut unrelated),
        ];
        optimizer.step(&mut params, step).unwrap();

        let x = parameter.data.as_slice();
        let distance_squared =
            (x[0] - 7.0).powi(2) + (x[1] + 1.0).powi(2) + (x[2] - 11.5).powi(2);
        if distance_squared < 0.01 {
            reached_minimum = true;
            break;
        }
    }
    assert!(reached_minimum, "optimizer did not reach the minimum");
    assert!(unrelated.data.as_slice().iter().all(|&v| v == 0.0));
}

#[test]
fn sgd_with_momentum_converges_on_quadratic() {
    let mut optimizer = SgdOptimizer::new(0.1, 0.8);
    check_quadratic_convergence(&mut optimizer);
}

#[test]
fn adam_converges_on_quadratic() {
    let mut optimizer = AdamOptimizer::new(0.1, 0.9, 0.999, 1e-8);
    check_quadratic_convergence(&mut optimizer);
}

#[test]
fn factory_builds_both_methods() {
    let mut sgd = optimizer_from_json(&json!({
        "optimization_method": "gd",
        "gd_momentum": 0.8,
        "learning_rate": 0.1
    }))
    .unwrap();
    assert_eq!(sgd.name(), "gd");
    check_quadratic_convergence(sgd.as_mut());

    let mut adam = optimizer_from_json(&json!({
        "optimization_method": "adam",
        "ad_step_size": 0.1,
        "ad_epsilon": 0.00000001
    }))
    .unwrap();
    assert_eq!(adam.name(), "adam");
    check_quadratic_convergence(adam.as_mut());
}

#[test]
fn factory_rejects_unknown_method() {
    assert!(optimizer_from_json(&json!({ "optimization_method": "newton" })).is_err());
}

#[test]
fn step_zeroes_gradients() {
    let mut optimizer = SgdOptimizer::new(0.1, 0.0);
    let mut parameter = CombinedTensor::from_dims(1, 1, 1, 4);
    parameter.delta.clear(1.0);
    let mut params = [ParamRef::new(&mut parameter)];
    optimizer.step(&mut params, 0).unwrap();
    assert!(parameter.delta.as_slice().iter().all(|&v| v == 0.0));
}

#[test]
fn learning_rate_schedule_decays() {
    // eta(t) = lr / (1 + gamma t)^p: a large late step must move less than
    // an early one for the same gradient.
    let mut optimizer = SgdOptimizer::new(0.1, 0.0).with_schedule(0.1, 1.0);
    let mut parameter = CombinedTensor::from_dims(1, 1, 1, 1);

    parameter.delta.as_slice_mut()[0] = 1.0;
    let mut params = [ParamRef::new(&mut parameter)];
    optimizer.step(&mut params, 0).unwrap();
    let early_move = parameter.data.as_slice()[0].abs();

    parameter.data.clear(0.0);
    parameter.delta.as_slice_mut()[0] = 1.0;
    let mut params = [ParamRef::new(&mut parameter)];
    optimizer.step(&mut params, 1000).unwrap();
    let late_move = parameter.data.as_slice()[0].abs();

    assert!(late_move < early_move / 10.0);
}
