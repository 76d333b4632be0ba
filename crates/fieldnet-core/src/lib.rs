//! Discrete-event simulation kernel for aggregate computing.
//!
//! A [`Network`] drives many simulated devices ("nodes") through repeated
//! asynchronous computation rounds. Each round runs a pluggable
//! [`RoundProgram`] that exchanges per-round values with spatially-proximate
//! neighbors through the retained [`MessageStore`], persists per-node state
//! with the `old` primitive, and writes schema-validated storage tags that
//! periodic log events reduce into summary statistics.
//!
//! Round semantics are deliberately self-stabilizing: the neighbor field
//! observed at round *t* holds values exported at round *t-1* or earlier
//! (still within the retention window). One-round staleness models
//! asynchronous best-effort propagation and is expected, not a defect.

use fieldnet_index::{IndexError, NeighborhoodIndex, UniformGridIndex};
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Stable handle for nodes backed by a generational slot map.
    pub struct NodeId;
}

/// Convenience alias for associating side data with nodes.
pub type NodeMap<T> = SecondaryMap<NodeId, T>;

/// Continuous simulation time in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct SimTime(pub f64);

impl SimTime {
    /// Time zero.
    pub const ZERO: Self = Self(0.0);

    /// Construct from a number of seconds.
    #[must_use]
    pub const fn seconds(seconds: f64) -> Self {
        Self(seconds)
    }

    /// Shift this instant forward by `delta` seconds.
    #[must_use]
    pub fn offset(self, delta: f64) -> Self {
        Self(self.0 + delta)
    }

    /// Seconds elapsed since `earlier` (negative if `earlier` is later).
    #[must_use]
    pub fn delta_since(self, earlier: Self) -> f64 {
        self.0 - earlier.0
    }
}

/// Position or velocity vector in a configurable-dimension space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector(SmallVec<[f64; 3]>);

impl Vector {
    /// Zero vector with the given dimensionality.
    #[must_use]
    pub fn zeros(dimensions: usize) -> Self {
        Self(SmallVec::from_elem(0.0, dimensions))
    }

    /// Construct from component values.
    #[must_use]
    pub fn from_slice(components: &[f64]) -> Self {
        Self(SmallVec::from_slice(components))
    }

    /// Number of components.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Component along `axis`, zero when out of range.
    #[must_use]
    pub fn component(&self, axis: usize) -> f64 {
        self.0.get(axis).copied().unwrap_or(0.0)
    }

    /// Borrow the raw component slice.
    #[must_use]
    pub fn components(&self) -> &[f64] {
        &self.0
    }

    /// Euclidean norm.
    #[must_use]
    pub fn norm(&self) -> f64 {
        self.0.iter().map(|c| c * c).sum::<f64>().sqrt()
    }

    /// Euclidean distance to `other`, padding missing components with zero.
    #[must_use]
    pub fn distance(&self, other: &Self) -> f64 {
        let dims = self.dim().max(other.dim());
        (0..dims)
            .map(|axis| {
                let delta = self.component(axis) - other.component(axis);
                delta * delta
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Component-wise scaling.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self(self.0.iter().map(|c| c * factor).collect())
    }

    /// Component-wise difference `self - other`.
    #[must_use]
    pub fn minus(&self, other: &Self) -> Self {
        let dims = self.dim().max(other.dim());
        Self(
            (0..dims)
                .map(|axis| self.component(axis) - other.component(axis))
                .collect(),
        )
    }

    /// In-place `self += other * factor`.
    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        for (axis, component) in self.0.iter_mut().enumerate() {
            *component += other.component(axis) * factor;
        }
    }

    /// Projection onto the first two axes, used by the spatial prefilter.
    #[must_use]
    pub fn projected_2d(&self) -> (f64, f64) {
        (self.component(0), self.component(1))
    }
}

/// Payload value exchanged between nodes and stored in node storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Vector(Vector),
}

impl Value {
    /// Discriminant of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Real(_) => ValueKind::Real,
            Self::Vector(_) => ValueKind::Vector,
        }
    }

    /// Numeric view covering both `Int` and `Real`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer view.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

/// Storage value types declarable in a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Real,
    Vector,
}

impl ValueKind {
    /// Whether values of this kind participate in numeric reductions.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Real)
    }
}

/// Ordered list of `(tag, type)` pairs declared once at startup.
///
/// Node storage only accepts writes to declared tags with matching types;
/// anything else is a program fault surfaced as a [`KernelError`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSchema {
    entries: Vec<(Cow<'static, str>, ValueKind)>,
}

impl StorageSchema {
    /// Empty schema; populate with [`StorageSchema::with`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tag declaration, builder style.
    #[must_use]
    pub fn with(mut self, tag: impl Into<Cow<'static, str>>, kind: ValueKind) -> Self {
        self.entries.push((tag.into(), kind));
        self
    }

    /// Declared type of `tag`, if present.
    #[must_use]
    pub fn kind_of(&self, tag: &str) -> Option<ValueKind> {
        self.entries
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, kind)| *kind)
    }

    /// Number of declared tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no tags are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate declared tag names in declaration order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_ref())
    }

    fn first_duplicate(&self) -> Option<&str> {
        for (idx, (name, _)) in self.entries.iter().enumerate() {
            if self.entries[..idx].iter().any(|(other, _)| other == name) {
                return Some(name.as_ref());
            }
        }
        None
    }
}

/// Stable identifier for one use of `old`/`nbr` within a round program.
///
/// The same identifier must be passed at the same structural position of the
/// program on every round of a node's lifetime; the kernel validates this by
/// replaying the trace recorded on the node's first round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CallPoint(pub u32);

/// Which state-carrying primitive a call-point was used with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Old,
    Nbr,
}

/// One step of a node's recorded call-point trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub call_point: CallPoint,
    pub kind: PrimitiveKind,
}

/// Errors raised when validating kernel configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    /// An aggregator references a tag the schema does not declare.
    #[error("aggregator tag `{tag}` is not declared in the storage schema")]
    UnknownAggregatorTag { tag: String },
    /// A numeric reduction is configured over a non-numeric tag.
    #[error("aggregator {reduction:?} over `{tag}` requires a numeric tag, found {kind:?}")]
    NonNumericAggregatorTag {
        tag: String,
        reduction: ReductionKind,
        kind: ValueKind,
    },
    /// The schema declares the same tag twice.
    #[error("storage schema declares tag `{tag}` more than once")]
    DuplicateTag { tag: String },
}

/// Fatal errors surfaced while a simulation runs.
///
/// Protocol violations indicate a round program whose call-point sequence
/// diverged from the trace recorded on the node's first round; the kernel
/// fails loudly instead of silently misattributing state.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(
        "node {node:?} round {round}: {observed:?} does not match recorded {expected:?} at trace step {step}"
    )]
    TraceMismatch {
        node: NodeId,
        round: u64,
        step: usize,
        expected: TraceEntry,
        observed: TraceEntry,
    },
    #[error("node {node:?} round {round}: {observed:?} extends past the recorded trace")]
    TraceOverflow {
        node: NodeId,
        round: u64,
        observed: TraceEntry,
    },
    #[error("node {node:?} round {round}: round ended after {executed} of {expected} recorded call-points")]
    TraceTruncated {
        node: NodeId,
        round: u64,
        executed: usize,
        expected: usize,
    },
    #[error("node {node:?} round {round}: {call_point:?} used more than once in a single round")]
    DuplicateCallPoint {
        node: NodeId,
        round: u64,
        call_point: CallPoint,
    },
    #[error("node {node:?}: storage tag `{tag}` is not declared in the schema")]
    UnknownTag { node: NodeId, tag: String },
    #[error("node {node:?}: storage tag `{tag}` expects {expected:?}, got {actual:?}")]
    TagTypeMismatch {
        node: NodeId,
        tag: String,
        expected: ValueKind,
        actual: ValueKind,
    },
    #[error("node {node:?}: velocity has {actual} components, expected {expected}")]
    VelocityDimension {
        node: NodeId,
        expected: usize,
        actual: usize,
    },
}

/// Distribution of a scheduling interval or offset, sampled per occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IntervalSpec {
    /// Always the same duration.
    Fixed(f64),
    /// Uniform over `[min, max)`.
    Uniform { min: f64, max: f64 },
    /// Weibull with the given shape and scale parameters.
    Weibull { shape: f64, scale: f64 },
}

impl IntervalSpec {
    fn sample(&self, rng: &mut SmallRng) -> f64 {
        match *self {
            Self::Fixed(value) => value,
            Self::Uniform { min, max } => {
                if max > min {
                    rng.random_range(min..max)
                } else {
                    min
                }
            }
            Self::Weibull { shape, scale } => {
                let u: f64 = rng.random();
                scale * (-(1.0 - u).ln()).powf(1.0 / shape)
            }
        }
    }

    fn is_valid(&self, require_positive: bool) -> bool {
        match *self {
            Self::Fixed(value) => {
                value.is_finite() && if require_positive { value > 0.0 } else { value >= 0.0 }
            }
            Self::Uniform { min, max } => {
                min.is_finite()
                    && max.is_finite()
                    && max >= min
                    && if require_positive { min > 0.0 } else { min >= 0.0 }
            }
            Self::Weibull { shape, scale } => {
                shape.is_finite() && scale.is_finite() && shape > 0.0 && scale > 0.0
            }
        }
    }
}

/// When node creation events enter the queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SpawnSchedule {
    /// Every node spawns at the same instant.
    AllAt(f64),
    /// Node `i` spawns at `start + i * interval`.
    Staggered { start: f64, interval: f64 },
}

impl SpawnSchedule {
    fn time_of(&self, index: usize) -> f64 {
        match *self {
            Self::AllAt(time) => time,
            Self::Staggered { start, interval } => start + index as f64 * interval,
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            Self::AllAt(time) => time.is_finite() && time >= 0.0,
            Self::Staggered { start, interval } => {
                start.is_finite() && start >= 0.0 && interval.is_finite() && interval >= 0.0
            }
        }
    }
}

/// Axis-aligned region positions are sampled from when nodes spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub min: Vector,
    pub max: Vector,
}

impl Region {
    /// Rectangular region between two corners.
    #[must_use]
    pub fn rect(min: &[f64], max: &[f64]) -> Self {
        Self {
            min: Vector::from_slice(min),
            max: Vector::from_slice(max),
        }
    }

    fn sample(&self, rng: &mut SmallRng) -> Vector {
        Vector(
            (0..self.min.dim())
                .map(|axis| {
                    let lo = self.min.component(axis);
                    let hi = self.max.component(axis);
                    if hi > lo { rng.random_range(lo..hi) } else { lo }
                })
                .collect(),
        )
    }
}

/// Reductions applicable to a storage tag across all live nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReductionKind {
    Mean,
    Min,
    Max,
    Sum,
    Count,
}

/// One configured aggregate: a storage tag and the reduction applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSpec {
    pub tag: Cow<'static, str>,
    pub reduction: ReductionKind,
}

impl AggregatorSpec {
    /// Construct a new aggregator over `tag`.
    #[must_use]
    pub fn new(tag: impl Into<Cow<'static, str>>, reduction: ReductionKind) -> Self {
        Self {
            tag: tag.into(),
            reduction,
        }
    }
}

/// Static configuration for a simulation run, validated once at startup.
///
/// Without `max_time` or an external stop signal the periodic log schedule
/// keeps the event queue non-empty forever; finite runs should set one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Dimensionality of the simulated space.
    pub dimensions: usize,
    /// Maximum communication range between nodes (world units, > 0).
    pub communication_range: f64,
    /// Seconds a published message stays visible to neighbors (> 0).
    pub retention: f64,
    /// Number of nodes created by the spawn schedule.
    pub node_count: usize,
    /// When spawn events enter the queue.
    pub spawn: SpawnSchedule,
    /// Offset between a node's spawn and its first round (async mode only).
    pub round_start: IntervalSpec,
    /// Interval between consecutive rounds of one node.
    pub round_interval: IntervalSpec,
    /// Seconds between network-wide log events (> 0).
    pub log_interval: f64,
    /// Optional simulated instant at which the run terminates.
    pub max_time: Option<f64>,
    /// Lock-step rounds: zero start offset and a fixed shared interval.
    pub synchronised: bool,
    /// Execute same-timestamp rounds in parallel with rayon.
    pub parallel: bool,
    /// Region initial node positions are sampled from.
    pub spawn_region: Region,
    /// Storage tags and their types, fixed for the whole run.
    pub schema: StorageSchema,
    /// Reductions logged on every log event.
    pub aggregators: Vec<AggregatorSpec>,
    /// Maximum number of recent log batches retained in memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            dimensions: 2,
            communication_range: 100.0,
            retention: 2.0,
            node_count: 100,
            spawn: SpawnSchedule::AllAt(0.0),
            round_start: IntervalSpec::Uniform { min: 0.0, max: 1.0 },
            round_interval: IntervalSpec::Weibull {
                shape: 12.0,
                scale: 1.04,
            },
            log_interval: 1.0,
            max_time: None,
            synchronised: false,
            parallel: true,
            spawn_region: Region::rect(&[0.0, 0.0], &[500.0, 500.0]),
            schema: StorageSchema::new().with("node_size", ValueKind::Real),
            aggregators: vec![AggregatorSpec::new("node_size", ReductionKind::Mean)],
            history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl KernelConfig {
    /// Validates the configuration; every error here is fatal before start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimensions == 0 {
            return Err(ConfigError::Invalid("dimensions must be at least 1"));
        }
        if !(self.communication_range.is_finite() && self.communication_range > 0.0) {
            return Err(ConfigError::Invalid(
                "communication_range must be positive and finite",
            ));
        }
        if !(self.retention.is_finite() && self.retention > 0.0) {
            return Err(ConfigError::Invalid("retention must be positive and finite"));
        }
        if !(self.log_interval.is_finite() && self.log_interval > 0.0) {
            return Err(ConfigError::Invalid(
                "log_interval must be positive and finite",
            ));
        }
        if let Some(max_time) = self.max_time
            && !(max_time.is_finite() && max_time > 0.0)
        {
            return Err(ConfigError::Invalid("max_time must be positive and finite"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be non-zero"));
        }
        if !self.spawn.is_valid() {
            return Err(ConfigError::Invalid(
                "spawn times must be non-negative and finite",
            ));
        }
        if !self.round_start.is_valid(false) {
            return Err(ConfigError::Invalid(
                "round_start must be non-negative and finite",
            ));
        }
        if !self.round_interval.is_valid(true) {
            return Err(ConfigError::Invalid(
                "round_interval must be positive and finite",
            ));
        }
        if self.synchronised && !matches!(self.round_interval, IntervalSpec::Fixed(_)) {
            return Err(ConfigError::Invalid(
                "synchronised rounds require a fixed round_interval",
            ));
        }
        if self.spawn_region.min.dim() != self.dimensions
            || self.spawn_region.max.dim() != self.dimensions
        {
            return Err(ConfigError::Invalid(
                "spawn_region corners must match the configured dimensionality",
            ));
        }
        for axis in 0..self.dimensions {
            if self.spawn_region.min.component(axis) > self.spawn_region.max.component(axis) {
                return Err(ConfigError::Invalid(
                    "spawn_region min must not exceed max on any axis",
                ));
            }
        }
        if self.schema.is_empty() {
            return Err(ConfigError::Invalid("storage schema must not be empty"));
        }
        if let Some(tag) = self.schema.first_duplicate() {
            return Err(ConfigError::DuplicateTag {
                tag: tag.to_string(),
            });
        }
        for spec in &self.aggregators {
            let Some(kind) = self.schema.kind_of(&spec.tag) else {
                return Err(ConfigError::UnknownAggregatorTag {
                    tag: spec.tag.to_string(),
                });
            };
            if spec.reduction != ReductionKind::Count && !kind.is_numeric() {
                return Err(ConfigError::NonNumericAggregatorTag {
                    tag: spec.tag.to_string(),
                    reduction: spec.reduction,
                    kind,
                });
            }
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
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

/// Decides whether two positions are within communication reach.
///
/// The predicate is purely geometric and symmetric; excluding a node from
/// its own neighborhood is handled by the kernel, which never offers a
/// node's identifier to its own field queries.
pub trait Connector: Send + Sync {
    /// Whether nodes at `a` and `b` can exchange messages.
    fn connected(&self, a: &Vector, b: &Vector) -> bool;

    /// Upper bound on the distance at which `connected` can hold; feeds the
    /// spatial prefilter and must never under-report.
    fn range_hint(&self) -> f64;
}

/// Default policy: connected when the Euclidean distance is below a fixed range.
#[derive(Debug, Clone)]
pub struct FixedRange {
    range: f64,
}

impl FixedRange {
    /// Construct with the given communication range.
    #[must_use]
    pub const fn new(range: f64) -> Self {
        Self { range }
    }
}

impl Connector for FixedRange {
    fn connected(&self, a: &Vector, b: &Vector) -> bool {
        a.distance(b) < self.range
    }

    fn range_hint(&self) -> f64 {
        self.range
    }
}

/// A value published by a node at a call-point, with its visibility window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub value: Value,
    pub sent_at: SimTime,
    pub expires_at: SimTime,
}

/// Retained mailbox of per-call-point exports, bounded by the retention window.
///
/// Only one live message per `(sender, call_point)` pair is kept; publishing
/// replaces any earlier export from the same sender at the same call-point.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageStore {
    retention: f64,
    slots: HashMap<(NodeId, CallPoint), StoredMessage>,
}

impl MessageStore {
    /// Create an empty store with the given retention window in seconds.
    #[must_use]
    pub fn new(retention: f64) -> Self {
        Self {
            retention,
            slots: HashMap::new(),
        }
    }

    /// Record `value` as `sender`'s current export at `call_point`.
    pub fn publish(&mut self, sender: NodeId, call_point: CallPoint, value: Value, now: SimTime) {
        self.slots.insert(
            (sender, call_point),
            StoredMessage {
                value,
                sent_at: now,
                expires_at: now.offset(self.retention),
            },
        );
    }

    /// Unexpired exports at `call_point` from exactly `neighbor_ids`, keyed
    /// by sender. Missing data resolves to an empty mapping, never an error.
    #[must_use]
    pub fn neighbor_field(
        &self,
        call_point: CallPoint,
        requester: NodeId,
        now: SimTime,
        neighbor_ids: &[NodeId],
    ) -> BTreeMap<NodeId, Value> {
        let mut field = BTreeMap::new();
        for &sender in neighbor_ids {
            if sender == requester {
                continue;
            }
            if let Some(message) = self.slots.get(&(sender, call_point))
                && message.expires_at > now
            {
                field.insert(sender, message.value.clone());
            }
        }
        field
    }

    /// Remove messages whose expiry time is at or before `now`. Idempotent.
    pub fn expire(&mut self, now: SimTime) {
        self.slots.retain(|_, message| message.expires_at > now);
    }

    /// Number of live slots (one per sender and call-point).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when no messages are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Ephemeral per-round mapping from neighbor id to that neighbor's most
/// recently exported value at one call-point. Rebuilt every round, never
/// persisted, and never contains the requesting node itself; the node's own
/// previous export is available separately through [`NeighborField::local`].
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborField {
    values: BTreeMap<NodeId, Value>,
    local: Value,
}

impl NeighborField {
    fn new(values: BTreeMap<NodeId, Value>, local: Value) -> Self {
        Self { values, local }
    }

    /// Value exported by `neighbor`, if visible this round.
    #[must_use]
    pub fn get(&self, neighbor: NodeId) -> Option<&Value> {
        self.values.get(&neighbor)
    }

    /// The requesting node's own previous export at this call-point (the
    /// initial value on the node's first use).
    #[must_use]
    pub fn local(&self) -> &Value {
        &self.local
    }

    /// Iterate neighbor entries in stable id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Value)> {
        self.values.iter().map(|(id, value)| (*id, value))
    }

    /// Number of visible neighbor entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true when no neighbor values are visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Neighbor holding the smallest numeric value, if any.
    #[must_use]
    pub fn min_real(&self) -> Option<(NodeId, f64)> {
        self.iter()
            .filter_map(|(id, value)| value.as_f64().map(|v| (id, v)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Neighbor holding the largest numeric value, if any.
    #[must_use]
    pub fn max_real(&self) -> Option<(NodeId, f64)> {
        self.iter()
            .filter_map(|(id, value)| value.as_f64().map(|v| (id, v)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Largest numeric value across neighbors and the local entry.
    #[must_use]
    pub fn max_real_with_local(&self) -> Option<f64> {
        self.iter()
            .filter_map(|(_, value)| value.as_f64())
            .chain(self.local.as_f64())
            .max_by(|a, b| a.total_cmp(b))
    }
}

/// Per-node simulation state: physics, storage, and primitive memories.
#[derive(Debug, Clone)]
pub struct NodeState {
    position: Vector,
    velocity: Vector,
    storage: HashMap<Cow<'static, str>, Value>,
    memory: HashMap<CallPoint, Value>,
    exports: HashMap<CallPoint, Value>,
    trace: Vec<TraceEntry>,
    rounds: u64,
    last_round: SimTime,
    spawned_at: SimTime,
}

impl NodeState {
    fn new(position: Vector, dimensions: usize, spawned_at: SimTime) -> Self {
        Self {
            position,
            velocity: Vector::zeros(dimensions),
            storage: HashMap::new(),
            memory: HashMap::new(),
            exports: HashMap::new(),
            trace: Vec::new(),
            rounds: 0,
            last_round: spawned_at,
            spawned_at,
        }
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> &Vector {
        &self.position
    }

    /// Velocity applied between rounds.
    #[must_use]
    pub fn velocity(&self) -> &Vector {
        &self.velocity
    }

    /// Current value of a storage tag, if it has ever been written.
    #[must_use]
    pub fn storage_value(&self, tag: &str) -> Option<&Value> {
        self.storage.get(tag)
    }

    /// Number of completed rounds.
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Instant the node was created.
    #[must_use]
    pub fn spawned_at(&self) -> SimTime {
        self.spawned_at
    }

    fn integrate(&mut self, now: SimTime) {
        let dt = now.delta_since(self.last_round);
        if dt > 0.0 {
            let velocity = self.velocity.clone();
            self.position.add_scaled(&velocity, dt);
        }
    }
}

/// A pluggable round program: one synchronous, non-blocking pass over a
/// single node, applying all effects through the [`RoundContext`].
pub trait RoundProgram: Send + Sync {
    /// Execute one round for the node behind `ctx`.
    fn round(&self, ctx: &mut RoundContext<'_>) -> Result<(), KernelError>;
}

impl<F> RoundProgram for F
where
    F: Fn(&mut RoundContext<'_>) -> Result<(), KernelError> + Send + Sync,
{
    fn round(&self, ctx: &mut RoundContext<'_>) -> Result<(), KernelError> {
        self(ctx)
    }
}

#[derive(Debug, Default)]
struct RoundOutcome {
    observed: Vec<TraceEntry>,
    memory: Vec<(CallPoint, Value)>,
    exports: Vec<(CallPoint, Value)>,
    storage: Vec<(Cow<'static, str>, Value)>,
    velocity: Option<Vector>,
}

/// Handle given to the round program for one node and one round.
///
/// Reads observe the node's state as committed by its previous round plus
/// the message snapshot published before this timestep; writes are staged
/// and flushed atomically when the round completes.
pub struct RoundContext<'a> {
    node_id: NodeId,
    now: SimTime,
    node: &'a NodeState,
    store: &'a MessageStore,
    neighbor_ids: &'a [NodeId],
    schema: &'a StorageSchema,
    cursor: usize,
    outcome: RoundOutcome,
}

impl<'a> RoundContext<'a> {
    fn new(
        node_id: NodeId,
        now: SimTime,
        node: &'a NodeState,
        store: &'a MessageStore,
        neighbor_ids: &'a [NodeId],
        schema: &'a StorageSchema,
    ) -> Self {
        Self {
            node_id,
            now,
            node,
            store,
            neighbor_ids,
            schema,
            cursor: 0,
            outcome: RoundOutcome::default(),
        }
    }

    /// Identifier of the node being executed.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.node_id
    }

    /// Current simulation time.
    #[must_use]
    pub fn time(&self) -> SimTime {
        self.now
    }

    /// Rounds completed before this one (zero on the first round).
    #[must_use]
    pub fn round(&self) -> u64 {
        self.node.rounds
    }

    /// Current position.
    #[must_use]
    pub fn position(&self) -> &Vector {
        &self.node.position
    }

    /// Velocity committed by the previous round.
    #[must_use]
    pub fn velocity(&self) -> &Vector {
        &self.node.velocity
    }

    /// Identifiers of the nodes currently within connectivity range.
    #[must_use]
    pub fn neighbor_ids(&self) -> &[NodeId] {
        self.neighbor_ids
    }

    /// Stage a new velocity, applied when the round's effects flush.
    pub fn set_velocity(&mut self, velocity: Vector) -> Result<(), KernelError> {
        if velocity.dim() != self.node.position.dim() {
            return Err(KernelError::VelocityDimension {
                node: self.node_id,
                expected: self.node.position.dim(),
                actual: velocity.dim(),
            });
        }
        self.outcome.velocity = Some(velocity);
        Ok(())
    }

    /// Read a storage tag as committed by previous rounds.
    #[must_use]
    pub fn load(&self, tag: &str) -> Option<&Value> {
        self.node.storage.get(tag)
    }

    /// Stage a schema-validated storage write.
    pub fn store(
        &mut self,
        tag: impl Into<Cow<'static, str>>,
        value: Value,
    ) -> Result<(), KernelError> {
        let tag = tag.into();
        let Some(expected) = self.schema.kind_of(&tag) else {
            return Err(KernelError::UnknownTag {
                node: self.node_id,
                tag: tag.into_owned(),
            });
        };
        if value.kind() != expected {
            return Err(KernelError::TagTypeMismatch {
                node: self.node_id,
                tag: tag.into_owned(),
                expected,
                actual: value.kind(),
            });
        }
        self.outcome.storage.push((tag, value));
        Ok(())
    }

    /// Collect from the past: returns `initial` on the node's first use of
    /// `call_point`, and `update(previous)` on every later round. The carried
    /// value is private to this node.
    pub fn old(
        &mut self,
        call_point: CallPoint,
        initial: Value,
        update: impl FnOnce(Value) -> Value,
    ) -> Result<Value, KernelError> {
        self.check_call_point(call_point, PrimitiveKind::Old)?;
        let value = match self.node.memory.get(&call_point) {
            Some(previous) => update(previous.clone()),
            None => initial,
        };
        self.outcome.memory.push((call_point, value.clone()));
        Ok(value)
    }

    /// Collect from neighbors: evaluates `update` on the field of visible
    /// neighbor exports at `call_point` and publishes the result for
    /// neighbors to read at their next round. `initial` seeds the local
    /// entry before the node has exported anything.
    pub fn nbr(
        &mut self,
        call_point: CallPoint,
        initial: Value,
        update: impl FnOnce(&NeighborField) -> Value,
    ) -> Result<Value, KernelError> {
        self.check_call_point(call_point, PrimitiveKind::Nbr)?;
        let field = self.field_at(call_point, initial);
        let value = update(&field);
        self.outcome.exports.push((call_point, value.clone()));
        Ok(value)
    }

    /// Constant-export form of `nbr`: publishes `export` unconditionally and
    /// returns the field of neighbor values observed this round.
    pub fn share(
        &mut self,
        call_point: CallPoint,
        export: Value,
    ) -> Result<NeighborField, KernelError> {
        self.check_call_point(call_point, PrimitiveKind::Nbr)?;
        let field = self.field_at(call_point, export.clone());
        self.outcome.exports.push((call_point, export));
        Ok(field)
    }

    fn field_at(&self, call_point: CallPoint, fallback_local: Value) -> NeighborField {
        let values =
            self.store
                .neighbor_field(call_point, self.node_id, self.now, self.neighbor_ids);
        let local = self
            .node
            .exports
            .get(&call_point)
            .cloned()
            .unwrap_or(fallback_local);
        NeighborField::new(values, local)
    }

    fn check_call_point(
        &mut self,
        call_point: CallPoint,
        kind: PrimitiveKind,
    ) -> Result<(), KernelError> {
        let observed = TraceEntry { call_point, kind };
        if self.node.rounds == 0 {
            if self
                .outcome
                .observed
                .iter()
                .any(|entry| entry.call_point == call_point)
            {
                return Err(KernelError::DuplicateCallPoint {
                    node: self.node_id,
                    round: self.node.rounds,
                    call_point,
                });
            }
            self.outcome.observed.push(observed);
            return Ok(());
        }
        match self.node.trace.get(self.cursor) {
            Some(&expected) if expected == observed => {
                self.cursor += 1;
                Ok(())
            }
            Some(&expected) => Err(KernelError::TraceMismatch {
                node: self.node_id,
                round: self.node.rounds,
                step: self.cursor,
                expected,
                observed,
            }),
            None => Err(KernelError::TraceOverflow {
                node: self.node_id,
                round: self.node.rounds,
                observed,
            }),
        }
    }

    fn finish(self) -> Result<RoundOutcome, KernelError> {
        if self.node.rounds > 0 && self.cursor != self.node.trace.len() {
            return Err(KernelError::TraceTruncated {
                node: self.node_id,
                round: self.node.rounds,
                executed: self.cursor,
                expected: self.node.trace.len(),
            });
        }
        Ok(self.outcome)
    }
}

/// Kinds of events driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Spawn,
    Round(NodeId),
    Log,
    Terminate,
}

impl EventKind {
    // Tie-break at equal times: spawns land before the rounds that need the
    // node, logs observe every same-timestamp round effect, terminate last.
    fn rank(self) -> u8 {
        match self {
            Self::Spawn => 0,
            Self::Round(_) => 1,
            Self::Log => 2,
            Self::Terminate => 3,
        }
    }
}

/// A scheduled occurrence popped from the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: SimTime,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy)]
struct QueuedEvent {
    time: SimTime,
    rank: u8,
    seq: u64,
    kind: EventKind,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .0
            .total_cmp(&other.time.0)
            .then_with(|| self.rank.cmp(&other.rank))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Time-ordered event queue; the sole source of time advancement.
///
/// Current time is the timestamp of the last popped event and never moves
/// backwards: requests to schedule into the past are dropped with a warning
/// instead of corrupting the monotonicity invariant.
#[derive(Debug, Default)]
pub struct Scheduler {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    now: SimTime,
    seq: u64,
}

impl Scheduler {
    /// Create an empty queue at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time.
    #[must_use]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Enqueue an event. Returns false (and warns) for past-dated or
    /// non-finite timestamps, which are rejected rather than processed.
    pub fn schedule(&mut self, time: SimTime, kind: EventKind) -> bool {
        if !time.0.is_finite() || time.0 < self.now.0 {
            warn!(
                requested = time.0,
                now = self.now.0,
                ?kind,
                "rejected event scheduled before current simulation time"
            );
            return false;
        }
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(QueuedEvent {
            time,
            rank: kind.rank(),
            seq,
            kind,
        }));
        true
    }

    /// Pop the earliest event, advancing current time to its timestamp.
    pub fn pop(&mut self) -> Option<Event> {
        let Reverse(queued) = self.heap.pop()?;
        self.now = queued.time;
        Some(Event {
            time: queued.time,
            kind: queued.kind,
        })
    }

    /// Earliest pending event without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<Event> {
        self.heap.peek().map(|Reverse(queued)| Event {
            time: queued.time,
            kind: queued.kind,
        })
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true when no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// One reduced aggregate emitted by a log event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub tag: Cow<'static, str>,
    pub reduction: ReductionKind,
    /// Reduced value; `None` when no node held the tag (Count is always `Some`).
    pub value: Option<f64>,
    /// Number of nodes that contributed to the reduction.
    pub samples: usize,
}

/// All aggregates produced by one log event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogBatch {
    pub time: SimTime,
    pub node_count: usize,
    pub records: Vec<LogRecord>,
}

/// Sink invoked once per log event with the reduced aggregates.
pub trait LogSink: Send {
    fn on_log(&mut self, batch: &LogBatch);
}

/// No-op log sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn on_log(&mut self, _batch: &LogBatch) {}
}

/// Owns all nodes, the scheduler, and the message store, and orchestrates a
/// full simulation run until the queue drains, a terminate event fires, or
/// the external stop flag is raised.
pub struct Network {
    config: KernelConfig,
    rng: SmallRng,
    nodes: SlotMap<NodeId, NodeState>,
    store: MessageStore,
    scheduler: Scheduler,
    program: Arc<dyn RoundProgram>,
    connector: Box<dyn Connector>,
    index: UniformGridIndex,
    sink: Box<dyn LogSink>,
    history: VecDeque<LogBatch>,
    stop: Arc<AtomicBool>,
    spawned: usize,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("config", &self.config)
            .field("now", &self.scheduler.now())
            .field("node_count", &self.nodes.len())
            .field("pending_events", &self.scheduler.len())
            .finish()
    }
}

impl Network {
    /// Build a network with the default fixed-range connector and no sink.
    pub fn new(config: KernelConfig, program: Arc<dyn RoundProgram>) -> Result<Self, ConfigError> {
        Self::with_sink(config, program, Box::new(NullSink))
    }

    /// Build a network delivering log batches to the supplied sink.
    pub fn with_sink(
        config: KernelConfig,
        program: Arc<dyn RoundProgram>,
        sink: Box<dyn LogSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let connector: Box<dyn Connector> = Box::new(FixedRange::new(config.communication_range));
        let index = UniformGridIndex::new(config.communication_range);
        let store = MessageStore::new(config.retention);
        let history_capacity = config.history_capacity;

        let mut scheduler = Scheduler::new();
        for idx in 0..config.node_count {
            scheduler.schedule(SimTime(config.spawn.time_of(idx)), EventKind::Spawn);
        }
        scheduler.schedule(SimTime::ZERO, EventKind::Log);
        if let Some(max_time) = config.max_time {
            scheduler.schedule(SimTime(max_time), EventKind::Terminate);
        }

        Ok(Self {
            config,
            rng,
            nodes: SlotMap::with_key(),
            store,
            scheduler,
            program,
            connector,
            index,
            sink,
            history: VecDeque::with_capacity(history_capacity),
            stop: Arc::new(AtomicBool::new(false)),
            spawned: 0,
        })
    }

    /// Replace the connectivity policy. The default is [`FixedRange`] over
    /// the configured communication range.
    #[must_use]
    pub fn with_connector(mut self, connector: Box<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Flag observed between events; raising it ends [`Network::run`].
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Current simulation time.
    #[must_use]
    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Number of live nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total nodes created since the start of the run.
    #[must_use]
    pub fn spawned_count(&self) -> usize {
        self.spawned
    }

    /// Borrow a node's state.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    /// Iterate all live nodes.
    pub fn iter_nodes(&self) -> impl Iterator<Item = (NodeId, &NodeState)> {
        self.nodes.iter()
    }

    /// Immutable access to the message store.
    #[must_use]
    pub fn message_store(&self) -> &MessageStore {
        &self.store
    }

    /// Iterate retained log batches, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &LogBatch> {
        self.history.iter()
    }

    /// Create a node at an explicit position and schedule its first round,
    /// bypassing the spawn-position distribution. Useful for scripted
    /// topologies and tests.
    pub fn spawn_node(&mut self, position: Vector) -> NodeId {
        let now = self.scheduler.now();
        let id = self
            .nodes
            .insert(NodeState::new(position, self.config.dimensions, now));
        let offset = if self.config.synchronised {
            0.0
        } else {
            self.config.round_start.sample(&mut self.rng)
        };
        self.scheduler
            .schedule(now.offset(offset), EventKind::Round(id));
        self.spawned += 1;
        id
    }

    /// Run until the queue drains, a terminate event fires, or the stop flag
    /// is raised. Configuration and protocol faults abort the run.
    pub fn run(&mut self) -> Result<(), KernelError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                debug!(now = self.scheduler.now().0, "external stop signal observed");
                return Ok(());
            }
            match self.step()? {
                None => return Ok(()),
                Some(event) if event.kind == EventKind::Terminate => return Ok(()),
                Some(_) => {}
            }
        }
    }

    /// Process a single event; `None` when the queue is exhausted.
    pub fn step(&mut self) -> Result<Option<Event>, KernelError> {
        let Some(event) = self.scheduler.pop() else {
            return Ok(None);
        };
        match event.kind {
            EventKind::Spawn => self.handle_spawn(event.time),
            EventKind::Round(id) => self.handle_rounds(event.time, id)?,
            EventKind::Log => self.handle_log(event.time),
            EventKind::Terminate => {
                debug!(now = event.time.0, "terminate event reached");
            }
        }
        Ok(Some(event))
    }

    fn handle_spawn(&mut self, time: SimTime) {
        let position = self.config.spawn_region.sample(&mut self.rng);
        let id = self.spawn_node(position);
        debug!(node = ?id, time = time.0, "node spawned");
    }

    /// Execute every round event sharing this timestamp as one batch, so all
    /// of them observe the message snapshot published by earlier timesteps.
    fn handle_rounds(&mut self, time: SimTime, first: NodeId) -> Result<(), KernelError> {
        let mut batch = vec![first];
        while let Some(next) = self.scheduler.peek() {
            if next.time == time
                && let EventKind::Round(id) = next.kind
            {
                self.scheduler.pop();
                batch.push(id);
            } else {
                break;
            }
        }
        batch.retain(|id| self.nodes.contains_key(*id));
        if batch.is_empty() {
            return Ok(());
        }

        self.store.expire(time);
        for &id in &batch {
            if let Some(node) = self.nodes.get_mut(id) {
                node.integrate(time);
            }
        }

        let neighbor_lists = self.resolve_neighbors(&batch)?;

        let results: Vec<Result<(NodeId, RoundOutcome), KernelError>> = {
            let nodes = &self.nodes;
            let store = &self.store;
            let schema = &self.config.schema;
            let program = Arc::clone(&self.program);
            let execute = move |id: NodeId,
                                neighbors: &[NodeId]|
                  -> Result<(NodeId, RoundOutcome), KernelError> {
                let node = &nodes[id];
                let mut ctx = RoundContext::new(id, time, node, store, neighbors, schema);
                program.round(&mut ctx)?;
                Ok((id, ctx.finish()?))
            };
            if self.config.parallel && batch.len() > 1 {
                batch
                    .par_iter()
                    .zip(neighbor_lists.par_iter())
                    .map(|(&id, neighbors)| execute(id, neighbors))
                    .collect()
            } else {
                batch
                    .iter()
                    .zip(neighbor_lists.iter())
                    .map(|(&id, neighbors)| execute(id, neighbors))
                    .collect()
            }
        };

        for result in results {
            let (id, outcome) = result?;
            self.commit(id, time, outcome);
            let interval = self.config.round_interval.sample(&mut self.rng);
            self.scheduler.schedule(time.offset(interval), EventKind::Round(id));
        }
        Ok(())
    }

    fn resolve_neighbors(&mut self, batch: &[NodeId]) -> Result<Vec<Vec<NodeId>>, KernelError> {
        let ids: Vec<NodeId> = self.nodes.keys().collect();
        let projected: Vec<(f64, f64)> = ids
            .iter()
            .map(|&id| self.nodes[id].position.projected_2d())
            .collect();
        self.index.rebuild(&projected)?;

        let mut index_of: NodeMap<usize> = SecondaryMap::new();
        for (idx, &id) in ids.iter().enumerate() {
            index_of.insert(id, idx);
        }

        let range = self.connector.range_hint();
        let range_sq = range * range;
        let lists = batch
            .iter()
            .map(|&id| {
                let origin = &self.nodes[id].position;
                let mut neighbors = Vec::new();
                self.index
                    .neighbors_within(index_of[id], range_sq, &mut |other, _dist| {
                        let other_id = ids[other];
                        if self
                            .connector
                            .connected(origin, &self.nodes[other_id].position)
                        {
                            neighbors.push(other_id);
                        }
                    });
                neighbors.sort_unstable();
                neighbors
            })
            .collect();
        Ok(lists)
    }

    fn commit(&mut self, id: NodeId, time: SimTime, outcome: RoundOutcome) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        for (call_point, value) in outcome.memory {
            node.memory.insert(call_point, value);
        }
        for (tag, value) in outcome.storage {
            node.storage.insert(tag, value);
        }
        if let Some(velocity) = outcome.velocity {
            node.velocity = velocity;
        }
        for (call_point, value) in outcome.exports {
            node.exports.insert(call_point, value.clone());
            self.store.publish(id, call_point, value, time);
        }
        if node.rounds == 0 {
            node.trace = outcome.observed;
        }
        node.rounds += 1;
        node.last_round = time;
    }

    fn handle_log(&mut self, time: SimTime) {
        let records = self
            .config
            .aggregators
            .iter()
            .map(|spec| self.reduce(spec))
            .collect();
        let batch = LogBatch {
            time,
            node_count: self.nodes.len(),
            records,
        };
        self.sink.on_log(&batch);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(batch);
        self.scheduler
            .schedule(time.offset(self.config.log_interval), EventKind::Log);
    }

    /// Reduce one storage tag across all live nodes. Nodes that never wrote
    /// the tag are excluded from the reduction, not an error.
    fn reduce(&self, spec: &AggregatorSpec) -> LogRecord {
        let mut samples = 0usize;
        let mut sum = 0.0f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for node in self.nodes.values() {
            let Some(value) = node.storage.get(spec.tag.as_ref()) else {
                continue;
            };
            samples += 1;
            if let Some(number) = value.as_f64() {
                sum += number;
                min = min.min(number);
                max = max.max(number);
            }
        }
        let value = match spec.reduction {
            ReductionKind::Count => Some(samples as f64),
            _ if samples == 0 => None,
            ReductionKind::Mean => Some(sum / samples as f64),
            ReductionKind::Min => Some(min),
            ReductionKind::Max => Some(max),
            ReductionKind::Sum => Some(sum),
        };
        LogRecord {
            tag: spec.tag.clone(),
            reduction: spec.reduction,
            value,
            samples,
        }
    }
}
