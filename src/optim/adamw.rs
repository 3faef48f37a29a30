//! # AdamW Optimizer with Gradient Surgery
//!
//! Each step snapshots the attached gradients, runs the projection pass from
//! [`super::surgery`] over the dense ones, and then applies a bias-corrected
//! Adam update followed by decoupled weight decay, one parameter at a time.

use super::config::{AdamWConfig, ParamGroupOptions};
use super::state::{ParamState, ParamStateRecord};
use super::surgery::{gradient_surgery, SurgeryReport};
use super::{OptimError, Optimizer};
use crate::tensor::{Gradient, Tensor, TensorData, TensorError};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// A set of parameters sharing hyperparameter overrides.
#[derive(Clone, Debug, Default)]
pub struct ParamGroup {
    pub params: Vec<Tensor>,
    pub options: ParamGroupOptions,
}

impl ParamGroup {
    pub fn new<I>(params: I) -> Self
    where
        I: IntoIterator<Item = Tensor>,
    {
        ParamGroup {
            params: params.into_iter().collect(),
            options: ParamGroupOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ParamGroupOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug)]
struct ManagedGroup {
    params: Vec<Tensor>,
    options: ParamGroupOptions,
    config: AdamWConfig, // options resolved against the defaults
}

/// Implements AdamW (decoupled weight decay) preceded by a pairwise gradient
/// projection pass over all gradients present at step time.
///
/// Parameters are identified by their position in the managed order: groups in
/// insertion order, parameters in group order. State is keyed by that position.
///
/// Reference: Decoupled Weight Decay Regularization - https://arxiv.org/abs/1711.05101
#[derive(Debug)]
pub struct AdamW {
    defaults: AdamWConfig,
    groups: Vec<ManagedGroup>,
    ids: HashSet<usize>,
    state: HashMap<usize, ParamState>,
}

impl AdamW {
    /// Creates an optimizer over a single parameter group.
    ///
    /// # Arguments
    /// * `params`: The parameters to optimize, in the order used for projection and state.
    /// * `config`: Hyperparameters shared by all parameters.
    pub fn new<I>(params: I, config: AdamWConfig) -> Result<Self, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params)], config)
    }

    /// Creates an optimizer over several groups.
    ///
    /// # Arguments
    /// * `groups`: Parameter groups in managed order. A group's options override `defaults`.
    /// * `defaults`: Hyperparameters for every field a group leaves unset.
    ///
    /// Fails on an invalid hyperparameter or on a parameter listed twice.
    pub fn with_groups(groups: Vec<ParamGroup>, defaults: AdamWConfig) -> Result<Self, OptimError> {
        defaults.validate()?;
        let mut optimizer = AdamW {
            defaults,
            groups: Vec::with_capacity(groups.len()),
            ids: HashSet::new(),
            state: HashMap::new(),
        };
        for group in groups {
            optimizer.add_param_group(group)?;
        }
        Ok(optimizer)
    }

    /// Appends a group. Fails without side effects on invalid options or a
    /// parameter that is already managed.
    pub fn add_param_group(&mut self, group: ParamGroup) -> Result<(), OptimError> {
        let config = group.options.resolve(&self.defaults)?;

        let base = self.num_params();
        let mut seen = HashSet::with_capacity(group.params.len());
        for (offset, param) in group.params.iter().enumerate() {
            let id = param.id();
            if self.ids.contains(&id) || !seen.insert(id) {
                return Err(OptimError::DuplicateParameter {
                    position: base + offset,
                });
            }
        }
        self.ids.extend(seen);
        self.groups.push(ManagedGroup {
            params: group.params,
            options: group.options,
            config,
        });
        Ok(())
    }

    pub fn defaults(&self) -> &AdamWConfig {
        &self.defaults
    }

    /// Resolved hyperparameters of each group, in order.
    pub fn group_configs(&self) -> impl Iterator<Item = &AdamWConfig> + '_ {
        self.groups.iter().map(|g| &g.config)
    }

    /// Managed parameters in position order.
    pub fn params(&self) -> impl Iterator<Item = &Tensor> + '_ {
        self.groups.iter().flat_map(|g| g.params.iter())
    }

    pub fn num_params(&self) -> usize {
        self.groups.iter().map(|g| g.params.len()).sum()
    }

    /// Position of a parameter in the managed order.
    pub fn position_of(&self, param: &Tensor) -> Option<usize> {
        let id = param.id();
        self.params().position(|p| p.id() == id)
    }

    /// State of a parameter, `None` until it has been stepped with a gradient.
    pub fn state_for(&self, param: &Tensor) -> Option<&ParamState> {
        self.position_of(param).and_then(|pos| self.state.get(&pos))
    }

    /// Detaches every managed gradient, so parameters untouched by the next
    /// backward pass are skipped by the next step instead of seeing zeros.
    pub fn clear_grad(&self) {
        for param in self.params() {
            param.clear_grad();
        }
    }

    /// Invokes `closure` once, runs a step, and hands back the closure's value.
    pub fn step_with_closure<F, L>(&mut self, closure: F) -> Result<L, OptimError>
    where
        F: FnOnce() -> L,
    {
        let loss = closure();
        self.step()?;
        Ok(loss)
    }

    /// Snapshot of the optimizer state for checkpointing.
    pub fn state_dict(&self) -> OptimizerStateDict {
        OptimizerStateDict {
            groups: self
                .groups
                .iter()
                .map(|g| GroupRecord {
                    options: g.options,
                    len: g.params.len(),
                })
                .collect(),
            state: self
                .state
                .iter()
                .map(|(&pos, s)| (pos, s.to_record()))
                .collect(),
        }
    }

    /// Restores state produced by [`AdamW::state_dict`] on an optimizer managing
    /// parameters of the same layout. Nothing changes if validation fails.
    pub fn load_state_dict(&mut self, dict: OptimizerStateDict) -> Result<(), OptimError> {
        let staged = self.stage_state_dict(dict)?;
        self.commit_state(staged);
        Ok(())
    }

    /// Validates `dict` against the managed layout without touching `self`.
    pub(crate) fn stage_state_dict(
        &self,
        dict: OptimizerStateDict,
    ) -> Result<StagedState, OptimError> {
        if dict.groups.len() != self.groups.len() {
            return Err(OptimError::StateMismatch(format!(
                "expected {} parameter groups, got {}",
                self.groups.len(),
                dict.groups.len()
            )));
        }
        let mut groups = Vec::with_capacity(dict.groups.len());
        for (index, (record, group)) in dict.groups.iter().zip(&self.groups).enumerate() {
            if record.len != group.params.len() {
                return Err(OptimError::StateMismatch(format!(
                    "group {} has {} parameters, state has {}",
                    index,
                    group.params.len(),
                    record.len
                )));
            }
            groups.push((record.options, record.options.resolve(&self.defaults)?));
        }

        let shapes: Vec<Vec<usize>> = self.params().map(|p| p.shape().to_vec()).collect();
        let mut state = HashMap::with_capacity(dict.state.len());
        for (pos, record) in dict.state {
            let expected = shapes.get(pos).ok_or_else(|| {
                OptimError::StateMismatch(format!("state for unknown position {}", pos))
            })?;
            let restored = ParamState::from_record(record)?;
            if restored.shape() != expected.as_slice() {
                return Err(TensorError::ShapeMismatch {
                    expected: expected.clone(),
                    got: restored.shape().to_vec(),
                }
                .into());
            }
            state.insert(pos, restored);
        }
        Ok(StagedState { groups, state })
    }

    /// Installs state checked by [`stage_state_dict`](Self::stage_state_dict). Cannot fail.
    pub(crate) fn commit_state(&mut self, staged: StagedState) {
        for (group, (options, config)) in self.groups.iter_mut().zip(staged.groups) {
            group.options = options;
            group.config = config;
        }
        self.state = staged.state;
    }
}

/// Optimizer state that passed validation and is ready to be installed.
#[derive(Debug)]
pub(crate) struct StagedState {
    groups: Vec<(ParamGroupOptions, AdamWConfig)>,
    state: HashMap<usize, ParamState>,
}

/// Applies one AdamW update to `param` and advances `state`.
fn adamw_update(
    param: &Tensor,
    grad: &ArrayD<TensorData>,
    state: &mut ParamState,
    config: &AdamWConfig,
) -> Result<(), TensorError> {
    let mut data = param.data_mut();
    for shape in [grad.shape(), state.m.shape(), data.shape()] {
        if shape != param.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: param.shape().to_vec(),
                got: shape.to_vec(),
            });
        }
    }
    let (beta1, beta2) = config.betas;

    state.t += 1;
    let t = state.t as f64;

    // m = beta1 * m + (1 - beta1) * g
    let (b1, one_minus_b1) = (beta1 as TensorData, (1.0 - beta1) as TensorData);
    Zip::from(&mut state.m)
        .and(grad)
        .for_each(|m, &g| *m = b1 * *m + one_minus_b1 * g);

    // v = beta2 * v + (1 - beta2) * g^2
    let (b2, one_minus_b2) = (beta2 as TensorData, (1.0 - beta2) as TensorData);
    Zip::from(&mut state.v)
        .and(grad)
        .for_each(|v, &g| *v = b2 * *v + one_minus_b2 * (g * g));

    let alpha_t: f64 = if config.correct_bias {
        config.lr * (1.0 - beta2.powf(t)).sqrt() / (1.0 - beta1.powf(t))
    } else {
        config.lr
    };
    let alpha_t = alpha_t as TensorData;
    let eps = config.eps as TensorData;
    let decay = (config.lr * config.weight_decay) as TensorData;

    Zip::from(&mut *data)
        .and(&state.m)
        .and(&state.v)
        .for_each(|p, &m, &v| {
            *p -= alpha_t * m / (v.sqrt() + eps);
            // decoupled weight decay on the post-step value, scaled by lr (not alpha_t)
            *p -= decay * *p;
        });
    Ok(())
}

impl Optimizer for AdamW {
    /// Snapshots gradients, runs the projection pass, then updates each parameter
    /// in position order. A sparse gradient aborts the step; parameters before it
    /// keep their update, parameters after it are untouched.
    fn step(&mut self) -> Result<(), OptimError> {
        // 1. Independent copies, so the projection never writes to the caller's buffers.
        let mut grads: Vec<Option<Gradient>> = self.params().map(Tensor::grad).collect();

        // 2. Projection over present dense gradients of groups that opted in.
        let surgery_flags: Vec<bool> = self
            .groups
            .iter()
            .flat_map(|g| std::iter::repeat(g.config.gradient_surgery).take(g.params.len()))
            .collect();
        let report = {
            let mut present: Vec<&mut ArrayD<TensorData>> = grads
                .iter_mut()
                .zip(&surgery_flags)
                .filter_map(|(grad, &enabled)| match grad {
                    Some(Gradient::Dense(g)) if enabled => Some(g),
                    _ => None,
                })
                .collect();
            if present.is_empty() {
                SurgeryReport::default()
            } else {
                gradient_surgery(&mut present)
            }
        };

        // 3. Per-parameter update.
        let mut updated = 0usize;
        let mut position = 0usize;
        for group in &self.groups {
            for param in &group.params {
                let pos = position;
                position += 1;
                let grad = match grads[pos].take() {
                    None => continue,
                    Some(Gradient::Sparse(_)) => {
                        tracing::debug!(position = pos, updated, "sparse gradient, aborting step");
                        return Err(OptimError::SparseGradient { position: pos });
                    }
                    Some(Gradient::Dense(g)) => g,
                };
                let state = self
                    .state
                    .entry(pos)
                    .or_insert_with(|| ParamState::new(param.shape()));
                adamw_update(param, &grad, state, &group.config)?;
                updated += 1;
            }
        }

        tracing::debug!(
            updated,
            skipped = position - updated,
            projected = report.projected,
            shape_mismatch = report.shape_mismatch,
            degenerate = report.degenerate,
            "adamw step"
        );
        Ok(())
    }

    fn zero_grad(&mut self) {
        for param in self.params() {
            param.zero_grad();
        }
    }
}

/// One group's entry in an [`OptimizerStateDict`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub options: ParamGroupOptions,
    pub len: usize,
}

/// Serializable optimizer state: group layout and options plus per-position state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    pub groups: Vec<GroupRecord>,
    pub state: BTreeMap<usize, ParamStateRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{zeros, SparseGradient};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tensor(values: &[TensorData]) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec()).unwrap()
    }

    fn values(a: &ArrayD<TensorData>) -> Vec<TensorData> {
        a.iter().copied().collect()
    }

    #[test]
    fn first_step_matches_closed_form() {
        let before = [1.0f32, -2.0, 0.5];
        let g = [0.3f32, -0.1, 2.0];
        let p = tensor(&before);
        p.accumulate_grad(&array![0.3, -0.1, 2.0].into_dyn()).unwrap();
        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::new(1e-3)).unwrap();
        opt.step().unwrap();

        let state = opt.state_for(&p).unwrap();
        assert_eq!(state.step(), 1);
        let (m, v, after) = (values(state.exp_avg()), values(state.exp_avg_sq()), values(&p.data()));
        let alpha_t = 1e-3 * (1.0f64 - 0.999).sqrt() / (1.0 - 0.9);
        for i in 0..3 {
            assert_abs_diff_eq!(m[i], 0.1 * g[i], epsilon = 1e-7);
            assert_abs_diff_eq!(v[i], 0.001 * g[i] * g[i], epsilon = 1e-7);
            let (m_i, v_i) = (0.1 * g[i] as f64, 0.001 * (g[i] as f64).powi(2));
            let expected = before[i] as f64 - alpha_t * m_i / (v_i.sqrt() + 1e-6);
            assert_abs_diff_eq!(after[i] as f64, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn uncorrected_step_uses_plain_lr() {
        let p = tensor(&[0.0]);
        p.accumulate_grad(&array![1.0].into_dyn()).unwrap();
        let config = AdamWConfig::new(0.1).with_correct_bias(false).with_eps(0.0);
        let mut opt = AdamW::new(vec![p.clone()], config).unwrap();
        opt.step().unwrap();
        // m = 0.1, sqrt(v) = sqrt(0.001)
        let expected = -0.1 * 0.1 / 0.001f64.sqrt();
        assert_abs_diff_eq!(values(&p.data())[0] as f64, expected, epsilon = 1e-5);
    }

    #[test]
    fn duplicate_parameters_fail_construction() {
        let p = zeros(&[2]);
        let err = AdamW::new(vec![p.clone(), p.clone()], AdamWConfig::default()).unwrap_err();
        assert!(matches!(err, OptimError::DuplicateParameter { position: 1 }));

        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::default()).unwrap();
        let err = opt.add_param_group(ParamGroup::new(vec![p])).unwrap_err();
        assert!(matches!(err, OptimError::DuplicateParameter { position: 1 }));
        assert_eq!(opt.num_params(), 1);
    }

    #[test]
    fn invalid_defaults_fail_construction() {
        let err = AdamW::new(vec![zeros(&[1])], AdamWConfig::new(-1.0)).unwrap_err();
        assert!(matches!(err, OptimError::InvalidHyperparameter { .. }));
    }

    #[test]
    fn closure_value_is_passed_through() {
        let p = tensor(&[1.0]);
        p.accumulate_grad(&array![1.0].into_dyn()).unwrap();
        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::default()).unwrap();
        let mut calls = 0;
        let loss = opt
            .step_with_closure(|| {
                calls += 1;
                0.25f32
            })
            .unwrap();
        assert_eq!(loss, 0.25);
        assert_eq!(calls, 1);
        assert_eq!(opt.state_for(&p).unwrap().step(), 1);
    }

    #[test]
    fn step_does_not_modify_attached_gradients() {
        let a = tensor(&[0.0, 0.0]);
        let b = tensor(&[0.0, 0.0]);
        a.accumulate_grad(&array![2.0, 1.0].into_dyn()).unwrap();
        b.accumulate_grad(&array![1.0, 0.0].into_dyn()).unwrap();
        let mut opt = AdamW::new(vec![a.clone(), b.clone()], AdamWConfig::default()).unwrap();
        opt.step().unwrap();
        assert_eq!(a.grad().unwrap().as_dense(), Some(&array![2.0, 1.0].into_dyn()));
    }

    #[test]
    fn surgery_changes_the_applied_gradient() {
        // a's gradient [2, 1] is projected against b's [1, 0] to [0, 1]; the first
        // coordinate of a then sees a zero gradient and does not move.
        let a = tensor(&[0.0, 0.0]);
        let b = tensor(&[0.0, 0.0]);
        a.accumulate_grad(&array![2.0, 1.0].into_dyn()).unwrap();
        b.accumulate_grad(&array![1.0, 0.0].into_dyn()).unwrap();
        let mut opt = AdamW::new(vec![a.clone(), b.clone()], AdamWConfig::default()).unwrap();
        opt.step().unwrap();
        let after = values(&a.data());
        assert_eq!(after[0], 0.0);
        assert!(after[1] < 0.0);
        assert_eq!(values(opt.state_for(&a).unwrap().exp_avg())[0], 0.0);
    }

    #[test]
    fn groups_without_surgery_are_left_out_of_the_pass() {
        let a = tensor(&[0.0, 0.0]);
        let b = tensor(&[0.0, 0.0]);
        a.accumulate_grad(&array![2.0, 1.0].into_dyn()).unwrap();
        b.accumulate_grad(&array![1.0, 0.0].into_dyn()).unwrap();
        let plain = ParamGroupOptions {
            gradient_surgery: Some(false),
            ..Default::default()
        };
        let groups = vec![
            ParamGroup::new(vec![a.clone()]).with_options(plain),
            ParamGroup::new(vec![b.clone()]),
        ];
        let mut opt = AdamW::with_groups(groups, AdamWConfig::default()).unwrap();
        opt.step().unwrap();
        assert!(values(&a.data())[0] < 0.0);
        assert_abs_diff_eq!(values(opt.state_for(&a).unwrap().exp_avg())[0], 0.2, epsilon = 1e-7);
    }

    #[test]
    fn group_lr_override_is_used() {
        let a = tensor(&[0.0]);
        let b = tensor(&[0.0]);
        a.accumulate_grad(&array![1.0].into_dyn()).unwrap();
        b.accumulate_grad(&array![-1.0].into_dyn()).unwrap();
        let fast = ParamGroupOptions {
            lr: Some(1e-2),
            ..Default::default()
        };
        let config = AdamWConfig::new(1e-3).with_gradient_surgery(false);
        let groups = vec![
            ParamGroup::new(vec![a.clone()]),
            ParamGroup::new(vec![b.clone()]).with_options(fast),
        ];
        let mut opt = AdamW::with_groups(groups, config).unwrap();
        opt.step().unwrap();
        // A first Adam step moves by ~lr * sign(g).
        assert_abs_diff_eq!(values(&a.data())[0], -1e-3, epsilon = 1e-5);
        assert_abs_diff_eq!(values(&b.data())[0], 1e-2, epsilon = 1e-4);
    }

    #[test]
    fn sparse_gradient_aborts_after_earlier_updates() {
        let a = tensor(&[1.0]);
        let s = tensor(&[1.0, 1.0]);
        let c = tensor(&[1.0]);
        a.accumulate_grad(&array![1.0].into_dyn()).unwrap();
        s.set_grad(Gradient::Sparse(
            SparseGradient::new(&[2], vec![0], vec![1.0]).unwrap(),
        ))
        .unwrap();
        c.accumulate_grad(&array![1.0].into_dyn()).unwrap();

        let config = AdamWConfig::default().with_gradient_surgery(false);
        let mut opt = AdamW::new(vec![a.clone(), s.clone(), c.clone()], config).unwrap();
        let err = opt.step().unwrap_err();
        assert!(matches!(err, OptimError::SparseGradient { position: 1 }));
        assert!(values(&a.data())[0] < 1.0);
        assert_eq!(values(&s.data()), vec![1.0, 1.0]);
        assert_eq!(values(&c.data()), vec![1.0]);
        assert!(opt.state_for(&s).is_none());
        assert!(opt.state_for(&c).is_none());
    }

    #[test]
    fn zero_grad_keeps_gradients_attached() {
        let p = tensor(&[1.0]);
        p.accumulate_grad(&array![3.0].into_dyn()).unwrap();
        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::default()).unwrap();
        opt.zero_grad();
        assert_eq!(p.grad().unwrap().as_dense(), Some(&array![0.0].into_dyn()));
    }

    #[test]
    fn cleared_parameters_are_skipped_entirely() {
        let p = tensor(&[1.0]);
        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::default()).unwrap();
        p.accumulate_grad(&array![3.0].into_dyn()).unwrap();
        opt.step().unwrap();
        let after_first = p.data_clone();

        opt.clear_grad();
        opt.step().unwrap();
        assert_eq!(p.data_clone(), after_first);
        assert_eq!(opt.state_for(&p).unwrap().step(), 1);
    }

    #[test]
    fn state_dict_round_trip_restores_training() {
        let p = tensor(&[1.0, 2.0]);
        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::default()).unwrap();
        for _ in 0..3 {
            p.accumulate_grad(&array![0.5, -0.5].into_dyn()).unwrap();
            opt.step().unwrap();
            p.clear_grad();
        }
        let dict = opt.state_dict();

        let q = Tensor::new(p.data_clone());
        let mut restored = AdamW::new(vec![q.clone()], AdamWConfig::default()).unwrap();
        restored.load_state_dict(dict).unwrap();
        assert_eq!(restored.state_for(&q), opt.state_for(&p));

        p.accumulate_grad(&array![0.1, 0.2].into_dyn()).unwrap();
        q.accumulate_grad(&array![0.1, 0.2].into_dyn()).unwrap();
        opt.step().unwrap();
        restored.step().unwrap();
        assert_eq!(p.data_clone(), q.data_clone());
    }

    #[test]
    fn load_state_dict_rejects_other_layouts() {
        let p = tensor(&[1.0, 2.0]);
        p.accumulate_grad(&array![1.0, 1.0].into_dyn()).unwrap();
        let mut opt = AdamW::new(vec![p.clone()], AdamWConfig::default()).unwrap();
        opt.step().unwrap();
        let dict = opt.state_dict();

        let mut wrong_shape = AdamW::new(vec![zeros(&[3])], AdamWConfig::default()).unwrap();
        assert!(matches!(
            wrong_shape.load_state_dict(dict.clone()),
            Err(OptimError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
        assert!(wrong_shape.state_dict().state.is_empty());

        let mut wrong_len =
            AdamW::new(vec![zeros(&[2]), zeros(&[2])], AdamWConfig::default()).unwrap();
        assert!(matches!(
            wrong_len.load_state_dict(dict),
            Err(OptimError::StateMismatch(_))
        ));
    }
}
