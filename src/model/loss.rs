//! Training objectives. `l2(x) = sum(x^2) / 2` throughout.
//!
//! With the dueling DQN head enabled the objective is the TD loss alone;
//! otherwise it is the actor-critic loss plus one term per enabled auxiliary
//! head.

use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use candle_nn::rnn::LSTMState;

use super::{PC_MAP, RP_CLASSES, UnrealModel};

const LOG_CLIP_MIN: f32 = 1e-20;

pub fn l2_loss(x: &Tensor) -> candle_core::Result<Tensor> {
    x.sqr()?.sum_all()?.affine(0.5, 0.0)
}

/// Policy-gradient loss with entropy bonus plus half-weighted value loss.
///
/// `pi` and `actions` are `[N, A]` (actions one-hot), `advantages` and
/// `returns` are `[N]`.
pub fn base_loss(
    pi: &Tensor,
    v: &Tensor,
    actions: &Tensor,
    advantages: &Tensor,
    returns: &Tensor,
    entropy_beta: f64,
) -> candle_core::Result<Tensor> {
    // Clipping keeps log finite when a probability underflows to zero.
    let log_pi = pi.clamp(LOG_CLIP_MIN, 1.0f32)?.log()?;
    let entropy = pi.mul(&log_pi)?.sum(1)?.neg()?;
    let chosen_log_pi = log_pi.mul(actions)?.sum(1)?;
    let policy_loss = chosen_log_pi
        .mul(advantages)?
        .add(&entropy.affine(entropy_beta, 0.0)?)?
        .sum_all()?
        .neg()?;
    let value_loss = l2_loss(&returns.sub(v)?)?.affine(0.5, 0.0)?;
    policy_loss.add(&value_loss)
}

/// `lambda * l2(target - Q(s, a))` over the 20x20 pixel-change grid.
/// `pc_q` is `[N, A, 20, 20]`, `actions` one-hot `[N, A]`, `returns`
/// `[N, 20, 20]`.
pub fn pc_loss(
    pc_q: &Tensor,
    actions: &Tensor,
    returns: &Tensor,
    lambda: f64,
) -> candle_core::Result<Tensor> {
    let (n, a) = actions.dims2()?;
    let mask = actions.reshape((n, a, 1, 1))?;
    let q_taken = pc_q.broadcast_mul(&mask)?.sum(1)?;
    l2_loss(&returns.sub(&q_taken)?)?.affine(lambda, 0.0)
}

pub fn vr_loss(vr_v: &Tensor, returns: &Tensor) -> candle_core::Result<Tensor> {
    l2_loss(&returns.sub(vr_v)?)
}

/// Cross-entropy between predicted reward classes `[N, 3]` and one-hot targets.
pub fn rp_loss(rp_c: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let log_c = rp_c.clamp(LOG_CLIP_MIN, 1.0f32)?.log()?;
    target.mul(&log_c)?.sum_all()?.neg()
}

/// Mean squared TD error of `Q(s, a)` against `target_q`. `actions` holds
/// `i64` indices `[N]`.
pub fn deepq_loss(q_out: &Tensor, actions: &Tensor, target_q: &Tensor) -> candle_core::Result<Tensor> {
    let q = q_out.gather(&actions.unsqueeze(1)?, 1)?.squeeze(1)?;
    target_q.sub(&q)?.sqr()?.mean_all()
}

// =============================================================================
// Loss Inputs
// =============================================================================

/// An on-policy unroll in time order.
pub struct BaseBatch {
    pub images: Tensor,
    pub goals: Option<Tensor>,
    pub last_action_reward: Option<Tensor>,
    pub initial_state: Option<LSTMState>,
    pub actions: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
}

pub struct PcBatch {
    pub images: Tensor,
    pub goals: Option<Tensor>,
    pub last_action_reward: Option<Tensor>,
    pub actions: Tensor,
    pub returns: Tensor,
}

pub struct VrBatch {
    pub images: Tensor,
    pub goals: Option<Tensor>,
    pub last_action_reward: Option<Tensor>,
    pub returns: Tensor,
}

pub struct RpBatch {
    /// `[N*3, 3, 84, 84]`
    pub frames: Tensor,
    pub goals: Option<Tensor>,
    /// One-hot `[N, 3]`
    pub target: Tensor,
}

pub struct DeepQBatch {
    pub images: Tensor,
    pub goals: Option<Tensor>,
    pub actions: Tensor,
    pub target_q: Tensor,
}

#[derive(Default)]
pub struct LossInputs {
    pub base: Option<BaseBatch>,
    pub pc: Option<PcBatch>,
    pub vr: Option<VrBatch>,
    pub rp: Option<RpBatch>,
    pub deepq: Option<DeepQBatch>,
}

/// Summed objective plus the scalar value of each term that went into it.
pub struct LossBreakdown {
    pub total: Tensor,
    pub base: Option<f32>,
    pub pc: Option<f32>,
    pub vr: Option<f32>,
    pub rp: Option<f32>,
    pub deepq: Option<f32>,
}

impl LossBreakdown {
    pub fn total_value(&self) -> Result<f32> {
        Ok(self.total.to_scalar::<f32>()?)
    }
}

impl UnrealModel {
    /// Build the training objective for this network's enabled heads.
    pub fn prepare_loss(&self, inputs: &LossInputs) -> Result<LossBreakdown> {
        let config = self.config();

        if config.use_deepq_network {
            let batch = inputs
                .deepq
                .as_ref()
                .context("deepq network enabled but no deepq batch supplied")?;
            let lar = self.zero_last_action_reward(batch.images.dim(0)?)?;
            let q = self.deepq(&batch.images, batch.goals.as_ref(), lar.as_ref())?;
            let loss = deepq_loss(&q, &batch.actions, &batch.target_q)?;
            let value = loss.to_scalar::<f32>()?;
            return Ok(LossBreakdown {
                total: loss,
                base: None,
                pc: None,
                vr: None,
                rp: None,
                deepq: Some(value),
            });
        }

        let batch = inputs.base.as_ref().context("base batch is required")?;
        let out = self.base(
            &batch.images,
            batch.goals.as_ref(),
            batch.last_action_reward.as_ref(),
            batch.initial_state.as_ref(),
        )?;
        let base = base_loss(
            &out.pi,
            &out.v,
            &batch.actions,
            &batch.advantages,
            &batch.returns,
            config.entropy_beta,
        )?;
        let mut breakdown = LossBreakdown {
            base: Some(base.to_scalar::<f32>()?),
            total: base,
            pc: None,
            vr: None,
            rp: None,
            deepq: None,
        };

        if config.use_pixel_change {
            let batch = inputs
                .pc
                .as_ref()
                .context("pixel change enabled but no pc batch supplied")?;
            ensure!(
                batch.returns.dims().ends_with(&[PC_MAP, PC_MAP]),
                "pixel change targets must be [N, {PC_MAP}, {PC_MAP}]"
            );
            let out = self.pc(&batch.images, batch.goals.as_ref(), batch.last_action_reward.as_ref())?;
            let loss = pc_loss(&out.q, &batch.actions, &batch.returns, config.pixel_change_lambda)?;
            breakdown.pc = Some(loss.to_scalar::<f32>()?);
            breakdown.total = breakdown.total.add(&loss)?;
        }

        if config.use_value_replay {
            let batch = inputs
                .vr
                .as_ref()
                .context("value replay enabled but no vr batch supplied")?;
            let v = self.vr(&batch.images, batch.goals.as_ref(), batch.last_action_reward.as_ref())?;
            let loss = vr_loss(&v, &batch.returns)?;
            breakdown.vr = Some(loss.to_scalar::<f32>()?);
            breakdown.total = breakdown.total.add(&loss)?;
        }

        if config.use_reward_prediction {
            let batch = inputs
                .rp
                .as_ref()
                .context("reward prediction enabled but no rp batch supplied")?;
            ensure!(
                batch.target.dim(1)? == RP_CLASSES,
                "reward prediction target must have {RP_CLASSES} classes"
            );
            let c = self.rp(&batch.frames, batch.goals.as_ref())?;
            let loss = rp_loss(&c, &batch.target)?;
            breakdown.rp = Some(loss.to_scalar::<f32>()?);
            breakdown.total = breakdown.total.add(&loss)?;
        }

        Ok(breakdown)
    }
}
