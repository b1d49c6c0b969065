//! Core decision-and-reward loop shared across the SquadBots workspace.
//!
//! Every live bot is pushed through a sense -> act -> step cycle once per
//! simulation tick by the hosting runtime. This crate owns the middle of
//! that cycle: observation synthesis from host ray casts, constant-speed
//! motion integration with collision gating, narrow-cone hit resolution,
//! and a six-term fitness accumulator that is z-score normalized against
//! the whole population when a bot's episode ends. The scene itself
//! (geometry, rendering, the learning algorithm that produces actions)
//! lives behind the [`SimulationHost`] trait and the roster argument.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, Index, IndexMut, Sub};
use thiserror::Error;
use tracing::{debug, info};

/// Number of continuous action channels accepted by [`SquadEngine::step`].
pub const ACTION_SIZE: usize = 2;
/// Number of observation channels produced by [`SquadEngine::sense`].
pub const SENSOR_SIZE: usize = OBSTACLE_BEARINGS.len() + FLAG_BUCKETS.len();

/// Relative bearings (degrees) of the forward-arc obstacle rays.
pub const OBSTACLE_BEARINGS: [f64; 5] = [-60.0, -30.0, 0.0, 30.0, 60.0];

/// Non-overlapping relative-bearing windows `(lo, hi]` for the flag
/// compass, narrower near dead-ahead and wider toward the rear. Together
/// they cover `(-180, 180]` exactly.
pub const FLAG_BUCKETS: [(f64, f64); 11] = [
    (-180.0, -90.0),
    (-90.0, -60.0),
    (-60.0, -30.0),
    (-30.0, -15.0),
    (-15.0, -5.0),
    (-5.0, 5.0),
    (5.0, 15.0),
    (15.0, 30.0),
    (30.0, 60.0),
    (60.0, 90.0),
    (90.0, 180.0),
];

/// Inclusive bounds per action channel: forward/backward speed, then turn
/// rate in radians.
pub const ACTION_BOUNDS: [(f64, f64); ACTION_SIZE] = [(-1.0, 1.0), (-0.2, 0.2)];

/// Half-width (degrees) of the firing acceptance cone.
const FIRE_CONE_DEG: f64 = 2.0;
/// Amplification applied to bearing inside the range-penalty metric; a
/// candidate at the cone edge costs `1 / cos(40 degrees)` extra range.
const FIRE_BEARING_GAIN: f64 = 20.0;
/// Episode step at which staggered reinforcement spawns are requested.
const SPAWN_STEP: u32 = 3;

/// Wrap `heading + delta` into `[0, 360)` degrees.
#[must_use]
pub fn wrap_degrees(heading: f64, delta: f64) -> f64 {
    let sum = heading + delta;
    if sum.is_nan() {
        return 0.0;
    }
    let mut angle = sum % 360.0;
    if angle < 0.0 {
        angle += 360.0;
    }
    if angle >= 360.0 {
        angle -= 360.0;
    }
    angle
}

/// Normalize a signed bearing into `(-180, 180]` degrees.
#[must_use]
pub fn normalize_bearing(mut bearing: f64) -> f64 {
    if bearing.is_nan() {
        return 0.0;
    }
    while bearing <= -180.0 {
        bearing += 360.0;
    }
    while bearing > 180.0 {
        bearing -= 360.0;
    }
    bearing
}

/// Axis-aligned 2D world position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Planar pose: position plus heading in degrees, `[0, 360)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose {
    /// Construct a new pose.
    #[must_use]
    pub const fn new(x: f64, y: f64, heading: f64) -> Self {
        Self { x, y, heading }
    }

    /// The positional part of the pose.
    #[must_use]
    pub const fn position(self) -> Position {
        Position::new(self.x, self.y)
    }

    /// Euclidean distance from this pose to `target`.
    #[must_use]
    pub fn distance_to(self, target: Position) -> f64 {
        self.position().distance_to(target)
    }

    /// Relative bearing from this pose to `target` in `(-180, 180]`
    /// degrees. A coincident target reads as dead ahead rather than
    /// faulting on the undefined angle.
    #[must_use]
    pub fn bearing_to(self, target: Position) -> f64 {
        let dx = target.x - self.x;
        let dy = target.y - self.y;
        if dx == 0.0 && dy == 0.0 {
            return 0.0;
        }
        normalize_bearing(dy.atan2(dx).to_degrees() - self.heading)
    }
}

/// Opaque stable identifier assigned when a bot enters the arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BotId(pub u64);

/// Squad affiliation used to split same-side and opposing queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Team {
    #[default]
    Blue,
    Red,
}

impl Team {
    /// Whether `other` belongs to the opposing squad.
    #[must_use]
    pub const fn opposes(self, other: Self) -> bool {
        !matches!(
            (self, other),
            (Team::Blue, Team::Blue) | (Team::Red, Team::Red)
        )
    }
}

/// Clip played by the host renderer for a bot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Animation {
    #[default]
    Stand,
    Run,
}

/// The six scored objectives accumulated over an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitnessTerm {
    StandGround,
    StickTogether,
    ApproachEnemy,
    ApproachFlag,
    HitTarget,
    AvoidFire,
}

impl FitnessTerm {
    /// Number of scored objectives.
    pub const COUNT: usize = 6;

    /// All terms in accumulator order.
    pub const ALL: [FitnessTerm; Self::COUNT] = [
        FitnessTerm::StandGround,
        FitnessTerm::StickTogether,
        FitnessTerm::ApproachEnemy,
        FitnessTerm::ApproachFlag,
        FitnessTerm::HitTarget,
        FitnessTerm::AvoidFire,
    ];

    const fn slot(self) -> usize {
        self as usize
    }
}

/// Multi-objective episode score, one scalar per [`FitnessTerm`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Fitness([f64; FitnessTerm::COUNT]);

impl Fitness {
    /// A fitness with every term at zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0.0; FitnessTerm::COUNT])
    }

    /// Plain (unweighted) sum of all terms.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Dot product with a weight vector.
    #[must_use]
    pub fn weighted_sum(&self, weights: &FitnessWeights) -> f64 {
        FitnessTerm::ALL
            .iter()
            .map(|&term| weights[term] * self[term])
            .sum()
    }

    /// Weighted z-score against population statistics, summed to a
    /// scalar. A term whose population spread is zero contributes
    /// nothing rather than dividing by zero.
    #[must_use]
    pub fn z_score(&self, stats: &FitnessStats, weights: &FitnessWeights) -> f64 {
        FitnessTerm::ALL
            .iter()
            .map(|&term| {
                let spread = stats.stddev[term];
                if spread > 0.0 {
                    weights[term] * (self[term] - stats.mean[term]) / spread
                } else {
                    0.0
                }
            })
            .sum()
    }
}

impl Index<FitnessTerm> for Fitness {
    type Output = f64;

    fn index(&self, term: FitnessTerm) -> &f64 {
        &self.0[term.slot()]
    }
}

impl IndexMut<FitnessTerm> for Fitness {
    fn index_mut(&mut self, term: FitnessTerm) -> &mut f64 {
        &mut self.0[term.slot()]
    }
}

impl Add for Fitness {
    type Output = Fitness;

    fn add(self, rhs: Fitness) -> Fitness {
        let mut out = self;
        for (lhs, rhs) in out.0.iter_mut().zip(rhs.0) {
            *lhs += rhs;
        }
        out
    }
}

impl Sub for Fitness {
    type Output = Fitness;

    fn sub(self, rhs: Fitness) -> Fitness {
        let mut out = self;
        for (lhs, rhs) in out.0.iter_mut().zip(rhs.0) {
            *lhs -= rhs;
        }
        out
    }
}

/// Per-term weights applied when collapsing a fitness to a scalar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FitnessWeights(pub [f64; FitnessTerm::COUNT]);

impl Default for FitnessWeights {
    fn default() -> Self {
        Self([1.0; FitnessTerm::COUNT])
    }
}

impl Index<FitnessTerm> for FitnessWeights {
    type Output = f64;

    fn index(&self, term: FitnessTerm) -> &f64 {
        &self.0[term.slot()]
    }
}

/// Population mean and sample standard deviation per fitness term.
///
/// Recomputed from scratch on every normalization event; membership
/// changes between episodes, so nothing is maintained incrementally.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FitnessStats {
    pub mean: Fitness,
    pub stddev: Fitness,
}

impl FitnessStats {
    /// Compute statistics over the provided samples. A single sample has
    /// zero spread; an empty slice yields all-zero statistics.
    #[must_use]
    pub fn from_samples(samples: &[Fitness]) -> Self {
        let count = samples.len();
        if count == 0 {
            return Self::default();
        }
        let mut mean = Fitness::zero();
        for sample in samples {
            mean = mean + *sample;
        }
        for term in FitnessTerm::ALL {
            mean[term] /= count as f64;
        }
        let mut stddev = Fitness::zero();
        if count > 1 {
            for term in FitnessTerm::ALL {
                let variance: f64 = samples
                    .iter()
                    .map(|sample| {
                        let delta = sample[term] - mean[term];
                        delta * delta
                    })
                    .sum::<f64>()
                    / (count - 1) as f64;
                stddev[term] = variance.sqrt();
            }
        }
        Self { mean, stddev }
    }
}

/// Mutable record kept for each bot for its lifetime in the arena.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    /// Stable identity, immutable after first assignment.
    pub id: BotId,
    pub team: Team,
    /// Committed pose after the most recent step.
    pub pose: Pose,
    /// Pose before the most recent step; only used for intra-tick
    /// animation interpolation.
    pub prev_pose: Pose,
    /// Captured once on the episode's first step, restored by reset.
    pub initial_position: Position,
    pub initial_rotation: f64,
    /// Host-clock timestamp of the last pose commit.
    pub time: f64,
    pub start_time: f64,
    /// Step index within the current episode.
    pub episode_step: u32,
    pub total_damage: f64,
    /// Damage inflicted on this bot since its last step; drained into
    /// `total_damage` every tick.
    pub curr_damage: f64,
    pub fitness: Fitness,
    /// Previous episode's final accumulation; the population sample used
    /// for z-score normalization.
    pub prev_fitness: Fitness,
    /// Scalar set only on the terminal tick of an episode.
    pub final_fitness: f64,
    pub animation: Animation,
}

impl AgentState {
    fn new(id: BotId, team: Team) -> Self {
        Self {
            id,
            team,
            pose: Pose::default(),
            prev_pose: Pose::default(),
            initial_position: Position::default(),
            initial_rotation: 0.0,
            time: 0.0,
            start_time: 0.0,
            episode_step: 0,
            total_damage: 0.0,
            curr_damage: 0.0,
            fitness: Fitness::zero(),
            prev_fitness: Fitness::zero(),
            final_fitness: 0.0,
            animation: Animation::Stand,
        }
    }
}

/// Store of per-bot state keyed by stable identifier.
///
/// Entries appear on first use and disappear only through the explicit
/// removal hook driven by the population manager; an unknown id on
/// lookup is first-use initialization, not an error.
#[derive(Debug, Default)]
pub struct AgentLedger {
    states: HashMap<BotId, AgentState>,
}

impl AgentLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked bots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true when no bots are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Whether `id` is currently tracked.
    #[must_use]
    pub fn contains(&self, id: BotId) -> bool {
        self.states.contains_key(&id)
    }

    /// Borrow the state for `id`, if tracked.
    #[must_use]
    pub fn get(&self, id: BotId) -> Option<&AgentState> {
        self.states.get(&id)
    }

    /// Mutably borrow the state for `id`, if tracked.
    #[must_use]
    pub fn get_mut(&mut self, id: BotId) -> Option<&mut AgentState> {
        self.states.get_mut(&id)
    }

    /// Lookup-or-create: unknown ids get a fresh default-team record.
    pub fn state_mut(&mut self, id: BotId) -> &mut AgentState {
        self.states
            .entry(id)
            .or_insert_with(|| AgentState::new(id, Team::default()))
    }

    /// Insert-on-first-use with an explicit squad assignment. Idempotent;
    /// re-enrolling an existing bot only updates its team.
    pub fn enroll(&mut self, id: BotId, team: Team) -> &mut AgentState {
        let state = self
            .states
            .entry(id)
            .or_insert_with(|| AgentState::new(id, team));
        state.team = team;
        state
    }

    /// Removal hook for the population manager.
    pub fn remove(&mut self, id: BotId) -> Option<AgentState> {
        self.states.remove(&id)
    }

    /// Iterate over tracked states in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &AgentState> {
        self.states.values()
    }

    /// Iterate mutably over tracked states.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AgentState> {
        self.states.values_mut()
    }
}

/// Inclusive bounds for one continuous channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bounds {
    pub lo: f64,
    pub hi: f64,
}

/// Declared shape of an action or sensor vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpaceSpec {
    pub bounds: Vec<Bounds>,
}

impl SpaceSpec {
    /// Number of channels in the space.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Returns true when the space has no channels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Check a vector against the declared bounds. NaN components fail
    /// the containment test and are rejected like any other excursion.
    pub fn validate(&self, values: &[f64]) -> Result<(), EngineError> {
        if values.len() != self.bounds.len() {
            return Err(EngineError::ActionLength {
                expected: self.bounds.len(),
                actual: values.len(),
            });
        }
        for (index, (value, bounds)) in values.iter().zip(&self.bounds).enumerate() {
            if !(bounds.lo..=bounds.hi).contains(value) {
                return Err(EngineError::ActionOutOfBounds {
                    index,
                    value: *value,
                    lo: bounds.lo,
                    hi: bounds.hi,
                });
            }
        }
        Ok(())
    }
}

/// Fixed bounds of the two-channel continuous action space.
#[must_use]
pub fn describe_action_space() -> SpaceSpec {
    SpaceSpec {
        bounds: ACTION_BOUNDS
            .iter()
            .map(|&(lo, hi)| Bounds { lo, hi })
            .collect(),
    }
}

/// Fixed bounds of the 16-channel observation space: 5 obstacle rays
/// followed by 11 flag-bearing buckets, all in `[0, 1]`.
#[must_use]
pub fn describe_sensor_space() -> SpaceSpec {
    SpaceSpec {
        bounds: vec![Bounds { lo: 0.0, hi: 1.0 }; SENSOR_SIZE],
    }
}

/// Validate an action vector against [`ACTION_BOUNDS`], failing fast on
/// arity mismatches or out-of-range components.
pub fn validate_action(action: &[f64]) -> Result<(), EngineError> {
    if action.len() != ACTION_SIZE {
        return Err(EngineError::ActionLength {
            expected: ACTION_SIZE,
            actual: action.len(),
        });
    }
    for (index, (value, &(lo, hi))) in action.iter().zip(&ACTION_BOUNDS).enumerate() {
        if !(lo..=hi).contains(value) {
            return Err(EngineError::ActionOutOfBounds {
                index,
                value: *value,
                lo,
                hi,
            });
        }
    }
    Ok(())
}

/// Errors surfaced by the engine.
#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    #[error("action has {actual} components, expected {expected}")]
    ActionLength { expected: usize, actual: usize },
    #[error("action component {index} = {value} outside [{lo}, {hi}]")]
    ActionOutOfBounds {
        index: usize,
        value: f64,
        lo: f64,
        hi: f64,
    },
    #[error("unknown bot {0:?}")]
    UnknownAgent(BotId),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Orchestration parameters snapshotted by the caller each tick.
///
/// The engine never caches these; the orchestrator may change any field
/// mid-episode (including the step budget) and the change takes effect
/// on the next call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Arena extent in world units.
    pub arena_width: f64,
    pub arena_height: f64,
    /// World units of travel per tick at full forward action.
    pub max_speed: f64,
    /// Length of the obstacle sensor rays.
    pub max_sensor_range: f64,
    /// Scalarization weights for the six fitness terms.
    pub weights: FitnessWeights,
    /// Numerator of the cohesion reward `coeff / distance`.
    pub stick_together_coeff: f64,
    /// Numerator of the aggression reward `coeff / distance`.
    pub approach_enemy_coeff: f64,
    /// Numerator of the flag reward `coeff / distance`.
    pub approach_flag_coeff: f64,
    /// Damage dealt per resolved hit.
    pub friendly_fire: f64,
    /// Episode step budget; 0 leaves episodes unbounded.
    pub lifetime: u32,
    /// Cumulative damage that ends an episode; 0 disables the check.
    pub hitpoints: f64,
    /// The point of interest bots are rewarded for approaching.
    pub flag: Position,
    /// Staging point for reinforcement spawns.
    pub spawn_staging: Position,
    /// Bots the orchestrator still wants added to the arena.
    pub pending_spawns: u32,
    /// Wall-clock seconds between bot decisions at normal speed.
    pub step_delay: f64,
    /// Fraction of the step delay removed when fast-forwarding, in [0, 1].
    pub speedup: f64,
    /// Optional seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arena_width: 256.0,
            arena_height: 256.0,
            max_speed: 12.0,
            max_sensor_range: 100.0,
            weights: FitnessWeights::default(),
            stick_together_coeff: 10.0,
            approach_enemy_coeff: 10.0,
            approach_flag_coeff: 10.0,
            friendly_fire: 1.0,
            lifetime: 20,
            hitpoints: 50.0,
            flag: Position::new(128.0, 200.0),
            spawn_staging: Position::new(128.0, 85.0),
            pending_spawns: 0,
            step_delay: 0.25,
            speedup: 0.0,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// Longest possible distance inside the arena, used to normalize the
    /// flag compass reading.
    #[must_use]
    pub fn max_diagonal(&self) -> f64 {
        self.arena_width.hypot(self.arena_height)
    }

    /// Effective seconds per decision window after fast-forwarding.
    #[must_use]
    pub fn animation_delay(&self) -> f64 {
        (self.step_delay * (1.0 - self.speedup)).max(0.0)
    }

    /// Validate the snapshot before it drives a tick.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.arena_width <= 0.0 || self.arena_height <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "arena dimensions must be positive",
            ));
        }
        if self.max_speed <= 0.0 {
            return Err(EngineError::InvalidConfig("max_speed must be positive"));
        }
        if self.max_sensor_range <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "max_sensor_range must be positive",
            ));
        }
        if self.step_delay < 0.0 {
            return Err(EngineError::InvalidConfig(
                "step_delay must be non-negative",
            ));
        }
        if !(0.0..=1.0).contains(&self.speedup) {
            return Err(EngineError::InvalidConfig("speedup must be within [0, 1]"));
        }
        if self.friendly_fire < 0.0 || self.hitpoints < 0.0 {
            return Err(EngineError::InvalidConfig(
                "friendly_fire and hitpoints must be non-negative",
            ));
        }
        Ok(())
    }

    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Result of a host ray intersection query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Bot struck by the ray, when the blocker is an agent rather than
    /// scenery.
    pub entity: Option<BotId>,
    /// World-space point at which the ray stopped.
    pub point: Position,
}

/// Services consumed from the hosting scene runtime.
///
/// The engine treats the host as the source of truth for on-screen pose
/// and wall-clock time; it never assumes ownership of the scene graph.
pub trait SimulationHost {
    /// Current on-screen position of a bot.
    fn position(&self, id: BotId) -> Position;

    /// Move a bot on screen.
    fn set_position(&mut self, id: BotId, position: Position);

    /// Rotate a bot on screen (heading degrees).
    fn set_rotation(&mut self, id: BotId, heading: f64);

    /// Nearest intersection along the segment `from -> to`, or `None`
    /// when the path is clear. Hosts may also use the query to draw the
    /// ray for debugging.
    fn cast_ray(&self, from: Position, to: Position) -> Option<RayHit>;

    /// Switch the animation clip played for a bot.
    fn set_animation(&mut self, id: BotId, animation: Animation);

    /// Wall-clock seconds.
    fn now(&self) -> f64;

    /// Ask the orchestrator to add one bot near `position`.
    fn request_spawn(&mut self, position: Position);
}

/// View of one candidate considered during target or proximity queries.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub id: BotId,
    pub pose: Pose,
}

/// Best firing match inside the narrow forward cone.
///
/// Candidates other than the actor are kept when their absolute relative
/// bearing is at most 2 degrees, then ranked by
/// `distance / cos(radians(bearing * 20))` so that range matters most at
/// dead-ahead and off-axis targets pay a steep penalty. A coincident
/// candidate reads as bearing zero.
#[must_use]
pub fn select_target(actor: &Pose, actor_id: BotId, candidates: &[Candidate]) -> Option<BotId> {
    candidates
        .iter()
        .filter(|candidate| candidate.id != actor_id)
        .filter_map(|candidate| {
            let distance = actor.distance_to(candidate.pose.position());
            let bearing = if distance == 0.0 {
                0.0
            } else {
                actor.bearing_to(candidate.pose.position()).abs()
            };
            if bearing > FIRE_CONE_DEG {
                return None;
            }
            let penalty = (bearing * FIRE_BEARING_GAIN).to_radians().cos();
            Some((candidate.id, OrderedFloat(distance / penalty)))
        })
        .min_by_key(|&(_, score)| score)
        .map(|(id, _)| id)
}

/// Closest candidate by raw Euclidean distance, excluding the actor by
/// id. Returns the match and its distance, or `None` when no other
/// candidate exists -- never a sentinel.
#[must_use]
pub fn nearest(origin: &Pose, actor_id: BotId, candidates: &[Candidate]) -> Option<(BotId, f64)> {
    candidates
        .iter()
        .filter(|candidate| candidate.id != actor_id)
        .map(|candidate| {
            (
                candidate.id,
                OrderedFloat(origin.distance_to(candidate.pose.position())),
            )
        })
        .min_by_key(|&(_, distance)| distance)
        .map(|(id, distance)| (id, distance.into_inner()))
}

/// `coeff / distance` with a zero contribution when no neighbor exists
/// or the distance degenerates to zero.
fn proximity_reward(coeff: f64, neighbor: Option<(BotId, f64)>) -> f64 {
    match neighbor {
        Some((_, distance)) if distance > 0.0 => coeff / distance,
        _ => 0.0,
    }
}

/// Fraction of a ray that was traversable: `1.0` when nothing blocks it,
/// otherwise hit distance over ray length. Zero-length rays are clear by
/// definition.
fn ray_fraction(
    host: &dyn SimulationHost,
    pose: Pose,
    bearing_offset: f64,
    length: f64,
) -> f64 {
    let heading = (pose.heading + bearing_offset).to_radians();
    let from = pose.position();
    let to = Position::new(
        from.x + length * heading.cos(),
        from.y + length * heading.sin(),
    );
    let ray_len = from.distance_to(to);
    if ray_len == 0.0 {
        return 1.0;
    }
    match host.cast_ray(from, to) {
        Some(hit) => from.distance_to(hit.point) / ray_len,
        None => 1.0,
    }
}

/// Per-tick orchestrator owning the agent ledger and the arena RNG.
///
/// All calls are synchronous and single-threaded; the host guarantees a
/// stable iteration order over bots within a tick, which is what makes
/// cross-agent damage visible before the victim's own drain step runs.
pub struct SquadEngine {
    ledger: AgentLedger,
    rng: SmallRng,
}

impl fmt::Debug for SquadEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SquadEngine")
            .field("agent_count", &self.ledger.len())
            .finish()
    }
}

impl SquadEngine {
    /// Build an engine, validating the initial configuration and seeding
    /// the RNG from it.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            ledger: AgentLedger::new(),
            rng: config.seeded_rng(),
        })
    }

    /// Read-only access to the agent ledger.
    #[must_use]
    pub fn ledger(&self) -> &AgentLedger {
        &self.ledger
    }

    /// Mutable access to the agent ledger.
    #[must_use]
    pub fn ledger_mut(&mut self) -> &mut AgentLedger {
        &mut self.ledger
    }

    /// Track a bot under an explicit squad. Idempotent.
    pub fn enroll(&mut self, id: BotId, team: Team) {
        self.ledger.enroll(id, team);
    }

    /// Stop tracking a bot, returning its final state.
    pub fn discharge(&mut self, id: BotId) -> Option<AgentState> {
        self.ledger.remove(id)
    }

    /// Borrow a bot's state, if tracked.
    #[must_use]
    pub fn agent_state(&self, id: BotId) -> Option<&AgentState> {
        self.ledger.get(id)
    }

    /// Zero every bot's previous-episode fitness sample, restarting the
    /// population baseline (typically after reweighting objectives).
    pub fn clear_population_baseline(&mut self) {
        for state in self.ledger.iter_mut() {
            state.prev_fitness = Fitness::zero();
        }
    }

    /// Synthesize the 16-element observation vector for a bot.
    ///
    /// Five forward-arc obstacle rays come first, then the flag compass:
    /// exactly one bearing bucket carries
    /// `clamp01((max_diagonal - flag_distance) / max_diagonal)`.
    pub fn sense(
        &mut self,
        id: BotId,
        host: &dyn SimulationHost,
        config: &EngineConfig,
    ) -> [f64; SENSOR_SIZE] {
        let pose = self.ledger.state_mut(id).pose;
        let mut observations = [0.0; SENSOR_SIZE];
        for (slot, bearing) in OBSTACLE_BEARINGS.iter().enumerate() {
            observations[slot] =
                ray_fraction(host, pose, *bearing, config.max_sensor_range).min(1.0);
        }
        let flag_distance = pose.distance_to(config.flag);
        let flag_bearing = pose.bearing_to(config.flag);
        let max_diagonal = config.max_diagonal();
        let reading = ((max_diagonal - flag_distance) / max_diagonal).clamp(0.0, 1.0);
        for (slot, &(lo, hi)) in FLAG_BUCKETS.iter().enumerate() {
            if flag_bearing > lo && flag_bearing <= hi {
                observations[OBSTACLE_BEARINGS.len() + slot] = reading;
            }
        }
        observations
    }

    /// Advance one bot by one tick and score the transition.
    ///
    /// Returns `0.0` on every tick except the terminal one, where the
    /// episode's accumulated fitness is z-scored against the population
    /// baseline (`roster` ids plus the acting bot's own sample) and the
    /// resulting scalar is both stored and returned.
    pub fn step(
        &mut self,
        id: BotId,
        action: &[f64],
        host: &mut dyn SimulationHost,
        config: &EngineConfig,
        roster: &[BotId],
    ) -> Result<f64, EngineError> {
        validate_action(action)?;
        config.validate()?;
        let now = host.now();

        let step_index = self.ledger.state_mut(id).episode_step;

        // First tick of an episode captures the spawn pose and randomizes
        // the facing.
        if step_index == 0 {
            let position = host.position(id);
            let heading = self.rng.random_range(0.0..360.0);
            host.set_rotation(id, heading);
            let state = self.ledger.state_mut(id);
            state.initial_position = position;
            state.initial_rotation = heading;
            state.pose = Pose::new(position.x, position.y, heading);
            state.prev_pose = state.pose;
            state.start_time = now;
            state.time = now;
        }

        // Staggered reinforcement: spawning a few ticks apart settles
        // better than one wave.
        if step_index == SPAWN_STEP && config.pending_spawns > 0 {
            let span = config.arena_width / 20.0;
            let dx = self.rng.random_range(-span / 2.0..span / 2.0);
            let dy = self.rng.random_range(-span / 2.0..span / 2.0);
            let position = Position::new(
                config.spawn_staging.x + dx,
                config.spawn_staging.y + dy,
            );
            debug!(bot = id.0, x = position.x, y = position.y, "requesting reinforcement spawn");
            host.request_spawn(position);
        }

        // Damage drains fully every tick; this tick's intake feeds the
        // AvoidFire term below.
        let (pose, team, damage_this_tick) = {
            let state = self.ledger.state_mut(id);
            state.total_damage += state.curr_damage;
            let damage = state.curr_damage;
            state.curr_damage = 0.0;
            (state.pose, state.team, damage)
        };

        let move_by = action[0];
        let turn_by = action[1].to_degrees();
        let new_heading = wrap_degrees(pose.heading, turn_by);
        let new_x = pose.x + config.max_speed * new_heading.to_radians().cos() * move_by;
        let new_y = pose.y + config.max_speed * new_heading.to_radians().sin() * move_by;

        // Collision gating: if the travel ray is blocked at all, the
        // position does not advance. The heading still does.
        let probe = Pose::new(pose.x, pose.y, new_heading);
        let safe = ray_fraction(host, probe, 0.0, config.max_speed * move_by) >= 1.0;
        let (next_x, next_y) = if safe { (new_x, new_y) } else { (pose.x, pose.y) };

        // Hit resolution against the opposing squad. The friendly-fire
        // coefficient applies when damage is inflicted, not when drained.
        let opponents: Vec<Candidate> = self
            .ledger
            .iter()
            .filter(|state| state.team.opposes(team))
            .map(|state| Candidate {
                id: state.id,
                pose: state.pose,
            })
            .collect();
        let mut hit = 0.0;
        if let Some(victim) = select_target(&pose, id, &opponents) {
            if let Some(target) = self.ledger.get_mut(victim) {
                target.curr_damage += 1.0 * config.friendly_fire;
                hit = 1.0;
            }
        }

        // Cohesion and aggression references, both excluding self by id.
        let friends: Vec<Candidate> = self
            .ledger
            .iter()
            .filter(|state| !state.team.opposes(team))
            .map(|state| Candidate {
                id: state.id,
                pose: state.pose,
            })
            .collect();
        let nearest_friend = nearest(&pose, id, &friends);
        let nearest_opponent = nearest(&pose, id, &opponents);
        let flag_distance = pose.distance_to(config.flag);

        let stand_ground = -move_by;
        let stick_together = proximity_reward(config.stick_together_coeff, nearest_friend);
        let approach_enemy = proximity_reward(config.approach_enemy_coeff, nearest_opponent);
        let approach_flag = if flag_distance > 0.0 {
            config.approach_flag_coeff / flag_distance
        } else {
            0.0
        };
        let avoid_fire = -damage_this_tick;

        {
            let state = self.ledger.state_mut(id);
            state.fitness[FitnessTerm::StandGround] += stand_ground;
            state.fitness[FitnessTerm::StickTogether] += stick_together;
            state.fitness[FitnessTerm::ApproachEnemy] += approach_enemy;
            state.fitness[FitnessTerm::ApproachFlag] += approach_flag;
            state.fitness[FitnessTerm::HitTarget] += hit;
            state.fitness[FitnessTerm::AvoidFire] += avoid_fire;
            state.prev_pose = state.pose;
            state.pose = Pose::new(next_x, next_y, new_heading);
            state.time = now;
            state.episode_step += 1;
        }

        // The screen pose lags one tick behind the committed pose;
        // is_active interpolates it forward between decisions.
        host.set_position(id, pose.position());
        host.set_rotation(id, new_heading);

        if config.lifetime > 0 && step_index + 1 >= config.lifetime {
            if roster.is_empty() {
                return Ok(0.0);
            }
            let mut samples: Vec<Fitness> = roster
                .iter()
                .filter_map(|member| self.ledger.get(*member))
                .map(|state| state.prev_fitness)
                .collect();
            if let Some(own) = self.ledger.get(id) {
                samples.push(own.prev_fitness);
            }
            let stats = FitnessStats::from_samples(&samples);
            let state = self.ledger.state_mut(id);
            let final_fitness = state.fitness.z_score(&stats, &config.weights);
            state.final_fitness = final_fitness;
            info!(
                bot = id.0,
                raw = state.fitness.weighted_sum(&config.weights),
                z_score = final_fitness,
                "episode fitness"
            );
            return Ok(final_fitness);
        }
        Ok(0.0)
    }

    /// Reinitialize a bot's episode state, restoring its captured spawn
    /// pose and rolling the just-finished fitness into the population
    /// baseline. Fails for untracked bots.
    pub fn reset_agent(
        &mut self,
        id: BotId,
        host: &mut dyn SimulationHost,
    ) -> Result<(), EngineError> {
        let state = self
            .ledger
            .get_mut(id)
            .ok_or(EngineError::UnknownAgent(id))?;
        host.set_position(id, state.initial_position);
        host.set_rotation(id, state.initial_rotation);
        state.pose = Pose::new(
            state.initial_position.x,
            state.initial_position.y,
            state.initial_rotation,
        );
        state.prev_pose = state.pose;
        state.total_damage = 0.0;
        state.curr_damage = 0.0;
        state.prev_fitness = state.fitness;
        state.fitness = Fitness::zero();
        state.episode_step = 0;
        Ok(())
    }

    /// Whether the bot's episode has ended, either by exhausting the
    /// step budget or by absorbing the damage threshold. Both checks
    /// poll the configuration snapshot, never cached values.
    #[must_use]
    pub fn is_episode_over(&self, id: BotId, config: &EngineConfig) -> bool {
        let Some(state) = self.ledger.get(id) else {
            return false;
        };
        if config.lifetime > 0 && state.episode_step >= config.lifetime {
            return true;
        }
        config.hitpoints > 0.0 && state.total_damage >= config.hitpoints
    }

    /// Report whether the bot should decide again, and as a byproduct
    /// drive the on-screen pose from `prev_pose` toward `pose` and flip
    /// the stand/run animation. Returns true at most once per delay
    /// window; the window restarts when it fires.
    pub fn is_active(
        &mut self,
        id: BotId,
        host: &mut dyn SimulationHost,
        config: &EngineConfig,
    ) -> bool {
        let now = host.now();
        let delay = config.animation_delay();
        let state = self.ledger.state_mut(id);
        let moved = state.prev_pose.x != state.pose.x || state.prev_pose.y != state.pose.y;
        if moved {
            let fraction = if delay > 0.0 {
                ((now - state.time) / delay).clamp(0.0, 1.0)
            } else {
                1.0
            };
            let x = state.prev_pose.x * (1.0 - fraction) + state.pose.x * fraction;
            let y = state.prev_pose.y * (1.0 - fraction) + state.pose.y * fraction;
            host.set_position(id, Position::new(x, y));
            if state.animation != Animation::Run {
                state.animation = Animation::Run;
                host.set_animation(id, Animation::Run);
            }
        } else if state.animation != Animation::Stand {
            state.animation = Animation::Stand;
            host.set_animation(id, Animation::Stand);
        }
        if now - state.time > delay {
            state.time = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHost {
        clock: f64,
    }

    impl NullHost {
        fn new() -> Self {
            Self { clock: 0.0 }
        }
    }

    impl SimulationHost for NullHost {
        fn position(&self, _id: BotId) -> Position {
            Position::default()
        }

        fn set_position(&mut self, _id: BotId, _position: Position) {}

        fn set_rotation(&mut self, _id: BotId, _heading: f64) {}

        fn cast_ray(&self, _from: Position, _to: Position) -> Option<RayHit> {
            None
        }

        fn set_animation(&mut self, _id: BotId, _animation: Animation) {}

        fn now(&self) -> f64 {
            self.clock
        }

        fn request_spawn(&mut self, _position: Position) {}
    }

    #[test]
    fn wrap_degrees_stays_in_range() {
        assert_eq!(wrap_degrees(350.0, 20.0), 10.0);
        assert_eq!(wrap_degrees(10.0, -20.0), 350.0);
        assert_eq!(wrap_degrees(0.0, 360.0), 0.0);
        assert_eq!(wrap_degrees(0.0, -720.0), 0.0);
        assert_eq!(wrap_degrees(f64::NAN, 1.0), 0.0);
        for (heading, delta) in [(123.4, 777.7), (-5.0, 0.1), (359.999, 0.001)] {
            let wrapped = wrap_degrees(heading, delta);
            assert!((0.0..360.0).contains(&wrapped), "{wrapped} out of range");
        }
    }

    #[test]
    fn normalize_bearing_half_open_interval() {
        assert_eq!(normalize_bearing(180.0), 180.0);
        assert_eq!(normalize_bearing(-180.0), 180.0);
        assert_eq!(normalize_bearing(190.0), -170.0);
        assert_eq!(normalize_bearing(-190.0), 170.0);
        assert_eq!(normalize_bearing(540.0), 180.0);
        assert_eq!(normalize_bearing(f64::NAN), 0.0);
    }

    #[test]
    fn bearing_to_coincident_target_is_zero() {
        let pose = Pose::new(10.0, 10.0, 137.0);
        assert_eq!(pose.bearing_to(Position::new(10.0, 10.0)), 0.0);
    }

    #[test]
    fn bearing_to_accounts_for_heading() {
        let pose = Pose::new(0.0, 0.0, 90.0);
        let bearing = pose.bearing_to(Position::new(0.0, 10.0));
        assert!(bearing.abs() < 1e-9, "straight ahead, got {bearing}");
        let bearing = pose.bearing_to(Position::new(10.0, 0.0));
        assert!((bearing + 90.0).abs() < 1e-9, "to the right, got {bearing}");
    }

    #[test]
    fn team_opposition() {
        assert!(Team::Blue.opposes(Team::Red));
        assert!(Team::Red.opposes(Team::Blue));
        assert!(!Team::Blue.opposes(Team::Blue));
        assert!(!Team::Red.opposes(Team::Red));
    }

    #[test]
    fn fitness_component_arithmetic() {
        let mut a = Fitness::zero();
        a[FitnessTerm::HitTarget] = 3.0;
        a[FitnessTerm::AvoidFire] = -2.0;
        let mut b = Fitness::zero();
        b[FitnessTerm::HitTarget] = 1.0;
        let sum = a + b;
        assert_eq!(sum[FitnessTerm::HitTarget], 4.0);
        assert_eq!(sum[FitnessTerm::AvoidFire], -2.0);
        let diff = a - b;
        assert_eq!(diff[FitnessTerm::HitTarget], 2.0);
        assert_eq!(sum.sum(), 2.0);
    }

    #[test]
    fn weighted_sum_respects_weights() {
        let mut fitness = Fitness::zero();
        fitness[FitnessTerm::StandGround] = 2.0;
        fitness[FitnessTerm::ApproachFlag] = 5.0;
        let mut weights = FitnessWeights::default();
        weights.0[FitnessTerm::StandGround as usize] = 0.5;
        weights.0[FitnessTerm::ApproachFlag as usize] = 2.0;
        assert_eq!(fitness.weighted_sum(&weights), 11.0);
    }

    #[test]
    fn stats_from_single_sample_has_zero_spread() {
        let mut sample = Fitness::zero();
        sample[FitnessTerm::HitTarget] = 7.0;
        let stats = FitnessStats::from_samples(&[sample]);
        assert_eq!(stats.mean[FitnessTerm::HitTarget], 7.0);
        assert_eq!(stats.stddev[FitnessTerm::HitTarget], 0.0);
    }

    #[test]
    fn stats_from_empty_population_is_default() {
        assert_eq!(FitnessStats::from_samples(&[]), FitnessStats::default());
    }

    #[test]
    fn z_score_skips_zero_spread_terms() {
        let mut low = Fitness::zero();
        low[FitnessTerm::HitTarget] = 1.0;
        let mut high = Fitness::zero();
        high[FitnessTerm::HitTarget] = 3.0;
        let stats = FitnessStats::from_samples(&[low, high]);
        // HitTarget spreads; every other term is identically zero across
        // the population and must contribute nothing.
        let score = high.z_score(&stats, &FitnessWeights::default());
        assert!(score.is_finite());
        assert!(score > 0.0);
        let symmetric = low.z_score(&stats, &FitnessWeights::default());
        assert!((score + symmetric).abs() < 1e-9);
    }

    #[test]
    fn select_target_rejects_outside_cone() {
        let actor = Pose::new(0.0, 0.0, 0.0);
        // ~2.86 degrees off-axis: outside the cone regardless of range.
        let candidates = [Candidate {
            id: BotId(2),
            pose: Pose::new(20.0, 1.0, 0.0),
        }];
        assert_eq!(select_target(&actor, BotId(1), &candidates), None);
    }

    #[test]
    fn select_target_prefers_on_axis_over_slightly_off() {
        let actor = Pose::new(0.0, 0.0, 0.0);
        // The off-axis candidate is nearer, but the bearing penalty at
        // 1.5 degrees inflates its effective range past the far one.
        let off_axis = Candidate {
            id: BotId(2),
            pose: Pose::new(45.0, 45.0 * 1.5_f64.to_radians().tan(), 0.0),
        };
        let on_axis = Candidate {
            id: BotId(3),
            pose: Pose::new(50.0, 0.0, 0.0),
        };
        assert_eq!(
            select_target(&actor, BotId(1), &[off_axis, on_axis]),
            Some(BotId(3))
        );
    }

    #[test]
    fn select_target_skips_self_and_handles_coincidence() {
        let actor = Pose::new(5.0, 5.0, 0.0);
        let candidates = [
            Candidate {
                id: BotId(1),
                pose: Pose::new(5.0, 5.0, 0.0),
            },
            Candidate {
                id: BotId(2),
                pose: Pose::new(5.0, 5.0, 90.0),
            },
        ];
        // Self is excluded by id; the coincident other reads as bearing
        // zero and wins trivially.
        assert_eq!(select_target(&actor, BotId(1), &candidates), Some(BotId(2)));
    }

    #[test]
    fn nearest_is_true_minimum() {
        let origin = Pose::new(0.0, 0.0, 0.0);
        let candidates = [
            Candidate {
                id: BotId(2),
                pose: Pose::new(30.0, 0.0, 0.0),
            },
            Candidate {
                id: BotId(3),
                pose: Pose::new(3.0, 4.0, 0.0),
            },
            Candidate {
                id: BotId(4),
                pose: Pose::new(10.0, 0.0, 0.0),
            },
        ];
        assert_eq!(nearest(&origin, BotId(1), &candidates), Some((BotId(3), 5.0)));
    }

    #[test]
    fn nearest_returns_none_without_others() {
        let origin = Pose::new(0.0, 0.0, 0.0);
        assert_eq!(nearest(&origin, BotId(1), &[]), None);
        let only_self = [Candidate {
            id: BotId(1),
            pose: Pose::new(1.0, 1.0, 0.0),
        }];
        assert_eq!(nearest(&origin, BotId(1), &only_self), None);
    }

    #[test]
    fn action_validation_catches_bad_vectors() {
        assert_eq!(validate_action(&[0.5, 0.1]), Ok(()));
        assert_eq!(validate_action(&[-1.0, -0.2]), Ok(()));
        assert!(matches!(
            validate_action(&[0.5]),
            Err(EngineError::ActionLength {
                expected: 2,
                actual: 1
            })
        ));
        assert!(matches!(
            validate_action(&[1.5, 0.0]),
            Err(EngineError::ActionOutOfBounds { index: 0, .. })
        ));
        assert!(matches!(
            validate_action(&[0.0, 0.3]),
            Err(EngineError::ActionOutOfBounds { index: 1, .. })
        ));
        assert!(matches!(
            validate_action(&[f64::NAN, 0.0]),
            Err(EngineError::ActionOutOfBounds { index: 0, .. })
        ));
    }

    #[test]
    fn space_specs_describe_fixed_shapes() {
        let actions = describe_action_space();
        assert_eq!(actions.len(), ACTION_SIZE);
        assert!(actions.validate(&[0.0, 0.0]).is_ok());
        assert!(actions.validate(&[0.0, 0.25]).is_err());
        let sensors = describe_sensor_space();
        assert_eq!(sensors.len(), SENSOR_SIZE);
        assert!(sensors.validate(&[0.5; SENSOR_SIZE]).is_ok());
        assert!(sensors.validate(&[1.5; SENSOR_SIZE]).is_err());
    }

    #[test]
    fn flag_buckets_partition_the_circle() {
        // Every representable bearing lands in exactly one bucket.
        for tenth in -1799..=1800 {
            let bearing = f64::from(tenth) / 10.0;
            let hits = FLAG_BUCKETS
                .iter()
                .filter(|&&(lo, hi)| bearing > lo && bearing <= hi)
                .count();
            assert_eq!(hits, 1, "bearing {bearing} hit {hits} buckets");
        }
    }

    #[test]
    fn ledger_creates_on_first_use_and_removes() {
        let mut ledger = AgentLedger::new();
        assert!(ledger.is_empty());
        let state = ledger.state_mut(BotId(9));
        assert_eq!(state.id, BotId(9));
        assert_eq!(state.team, Team::Blue);
        assert_eq!(ledger.len(), 1);
        ledger.enroll(BotId(9), Team::Red);
        assert_eq!(ledger.get(BotId(9)).unwrap().team, Team::Red);
        assert!(ledger.remove(BotId(9)).is_some());
        assert!(!ledger.contains(BotId(9)));
        assert!(ledger.remove(BotId(9)).is_none());
    }

    #[test]
    fn config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig {
            max_speed: 0.0,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = EngineConfig {
            speedup: 1.5,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = EngineConfig {
            arena_width: -1.0,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn animation_delay_scales_with_speedup() {
        let config = EngineConfig {
            step_delay: 0.25,
            speedup: 0.0,
            ..EngineConfig::default()
        };
        assert_eq!(config.animation_delay(), 0.25);
        let fast = EngineConfig {
            speedup: 1.0,
            ..config
        };
        assert_eq!(fast.animation_delay(), 0.0);
    }

    #[test]
    fn sense_reads_one_flag_bucket() {
        let config = EngineConfig {
            rng_seed: Some(0xDEAD_BEEF),
            ..EngineConfig::default()
        };
        let mut engine = SquadEngine::new(&config).unwrap();
        let id = BotId(1);
        engine.enroll(id, Team::Blue);
        engine.ledger_mut().state_mut(id).pose = Pose::new(50.0, 50.0, 0.0);
        let host = NullHost::new();
        let observations = engine.sense(id, &host, &config);
        for (slot, value) in observations.iter().enumerate() {
            assert!(
                (0.0..=1.0).contains(value),
                "sensor {slot} = {value} out of range"
            );
        }
        // Clear rays read fully open.
        for value in &observations[..OBSTACLE_BEARINGS.len()] {
            assert_eq!(*value, 1.0);
        }
        let lit: Vec<usize> = observations[OBSTACLE_BEARINGS.len()..]
            .iter()
            .enumerate()
            .filter(|(_, value)| **value > 0.0)
            .map(|(slot, _)| slot)
            .collect();
        assert_eq!(lit.len(), 1, "flag compass lit {lit:?}");
    }

    #[test]
    fn step_rejects_invalid_action_before_mutating() {
        let config = EngineConfig {
            rng_seed: Some(7),
            ..EngineConfig::default()
        };
        let mut engine = SquadEngine::new(&config).unwrap();
        let id = BotId(1);
        engine.enroll(id, Team::Blue);
        let mut host = NullHost::new();
        let err = engine
            .step(id, &[2.0, 0.0], &mut host, &config, &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::ActionOutOfBounds { .. }));
        assert_eq!(engine.agent_state(id).unwrap().episode_step, 0);
    }

    #[test]
    fn config_and_state_round_trip_through_json() {
        let config = EngineConfig {
            lifetime: 40,
            rng_seed: Some(99),
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let mut state = AgentState::new(BotId(7), Team::Red);
        state.pose = Pose::new(1.0, 2.0, 3.0);
        state.fitness[FitnessTerm::ApproachFlag] = 4.5;
        let json = serde_json::to_string(&state).unwrap();
        let back: AgentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn is_episode_over_honors_disabled_limits() {
        let config = EngineConfig {
            lifetime: 0,
            hitpoints: 0.0,
            rng_seed: Some(1),
            ..EngineConfig::default()
        };
        let mut engine = SquadEngine::new(&config).unwrap();
        let id = BotId(1);
        engine.enroll(id, Team::Blue);
        let state = engine.ledger_mut().state_mut(id);
        state.episode_step = 10_000;
        state.total_damage = 10_000.0;
        assert!(!engine.is_episode_over(id, &config));
        assert!(!engine.is_episode_over(BotId(42), &config));
        let bounded = EngineConfig {
            lifetime: 20,
            hitpoints: 50.0,
            ..config
        };
        assert!(engine.is_episode_over(id, &bounded));
    }
}
