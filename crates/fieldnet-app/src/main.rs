//! Command-line runner: a neighbour-census aggregate program over a swarm of
//! drifting nodes, with periodic aggregate logging to the console.

use anyhow::Result;
use clap::Parser;
use fieldnet_core::{
    AggregatorSpec, CallPoint, IntervalSpec, KernelConfig, KernelError, LogBatch, LogSink, Network,
    ReductionKind, RoundContext, RoundProgram, StorageSchema, Value, ValueKind,
};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "fieldnet", about = "Aggregate-computing network simulator")]
struct Args {
    /// Number of simulated nodes.
    #[arg(long, default_value_t = 100)]
    nodes: usize,

    /// Communication range in world units.
    #[arg(long, default_value_t = 100.0)]
    range: f64,

    /// Message retention window in seconds.
    #[arg(long, default_value_t = 2.0)]
    retention: f64,

    /// Simulated duration in seconds.
    #[arg(long, default_value_t = 60.0)]
    duration: f64,

    /// RNG seed for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Run all nodes in lock-step on a fixed one-second interval.
    #[arg(long)]
    synchronised: bool,
}

const DEGREE: CallPoint = CallPoint(0);
const MAX_EVER: CallPoint = CallPoint(1);
const NET_MAX: CallPoint = CallPoint(2);
const DEGREE_EXPORT: CallPoint = CallPoint(3);
const POSITION: CallPoint = CallPoint(4);

/// Counts connected neighbours, tracks the largest count this node has ever
/// seen, and gossips the largest count anywhere in the network. Each node
/// moves toward its least-connected neighbour so sparse regions fill in;
/// isolated nodes drift home toward the origin instead.
struct NeighbourCensus {
    range: f64,
}

impl RoundProgram for NeighbourCensus {
    fn round(&self, ctx: &mut RoundContext<'_>) -> Result<(), KernelError> {
        let field = ctx.share(DEGREE, Value::Int(1))?;
        let degree = field.len() as i64;

        let max_ever = ctx.old(MAX_EVER, Value::Int(degree), |previous| {
            Value::Int(previous.as_int().unwrap_or(0).max(degree))
        })?;

        let net_max = ctx.nbr(NET_MAX, Value::Int(degree), |field| {
            let best = field
                .iter()
                .filter_map(|(_, value)| value.as_int())
                .chain(field.local().as_int())
                .max()
                .unwrap_or(degree);
            Value::Int(best.max(degree))
        })?;

        ctx.store("degree", Value::Int(degree))?;
        ctx.store("max_degree", max_ever)?;
        ctx.store("net_max_degree", net_max)?;

        let degrees = ctx.share(DEGREE_EXPORT, Value::Int(degree))?;
        let positions = ctx.share(POSITION, Value::Vector(ctx.position().clone()))?;
        let drift = match degrees.min_real().map(|(id, _)| positions.get(id)) {
            Some(Some(Value::Vector(goal))) => {
                goal.minus(ctx.position()).scaled(1.0 / self.range)
            }
            _ => ctx.position().scaled(-1.0 / self.range),
        };
        ctx.set_velocity(drift)
    }
}

/// Prints each log batch through the tracing pipeline.
struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn on_log(&mut self, batch: &LogBatch) {
        for record in &batch.records {
            info!(
                time = batch.time.0,
                nodes = batch.node_count,
                tag = record.tag.as_ref(),
                reduction = ?record.reduction,
                value = record.value,
                samples = record.samples,
                "aggregate",
            );
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = KernelConfig {
        node_count: args.nodes,
        communication_range: args.range,
        retention: args.retention,
        max_time: Some(args.duration),
        synchronised: args.synchronised,
        round_interval: if args.synchronised {
            IntervalSpec::Fixed(1.0)
        } else {
            KernelConfig::default().round_interval
        },
        rng_seed: args.seed,
        schema: StorageSchema::new()
            .with("degree", ValueKind::Int)
            .with("max_degree", ValueKind::Int)
            .with("net_max_degree", ValueKind::Int),
        aggregators: vec![
            AggregatorSpec::new("degree", ReductionKind::Mean),
            AggregatorSpec::new("max_degree", ReductionKind::Max),
            AggregatorSpec::new("net_max_degree", ReductionKind::Max),
            AggregatorSpec::new("degree", ReductionKind::Count),
        ],
        ..KernelConfig::default()
    };

    let program: Arc<dyn RoundProgram> = Arc::new(NeighbourCensus { range: args.range });
    let mut network = Network::with_sink(config, program, Box::new(ConsoleSink))?;

    info!(
        nodes = args.nodes,
        range = args.range,
        duration = args.duration,
        "starting fieldnet simulation"
    );
    network.run()?;
    info!(
        simulated = network.now().0,
        nodes = network.node_count(),
        "simulation finished"
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
