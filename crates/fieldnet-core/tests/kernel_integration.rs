//! End-to-end scenarios driving a full `Network` through scripted topologies.

use fieldnet_core::{
    AggregatorSpec, CallPoint, IntervalSpec, KernelConfig, KernelError, LogBatch, Network,
    ReductionKind, RoundContext, RoundProgram, StorageSchema, Value, ValueKind, Vector,
};
use std::sync::Arc;

/// Lock-step configuration with no automatic spawns, for scripted topologies.
fn scripted_config(max_time: f64) -> KernelConfig {
    KernelConfig {
        node_count: 0,
        synchronised: true,
        round_interval: IntervalSpec::Fixed(1.0),
        round_start: IntervalSpec::Fixed(0.0),
        max_time: Some(max_time),
        rng_seed: Some(7),
        ..KernelConfig::default()
    }
}

fn census_program() -> Arc<dyn RoundProgram> {
    Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
        let field = ctx.share(CallPoint(0), Value::Int(1))?;
        ctx.store("degree", Value::Int(field.len() as i64))
    })
}

#[test]
fn neighbor_census_over_three_node_chain() {
    let mut config = scripted_config(2.0);
    config.schema = StorageSchema::new().with("degree", ValueKind::Int);
    config.aggregators = vec![AggregatorSpec::new("degree", ReductionKind::Sum)];

    let mut network = Network::new(config, census_program()).expect("valid config");
    let a = network.spawn_node(Vector::from_slice(&[0.0, 0.0]));
    let b = network.spawn_node(Vector::from_slice(&[90.0, 0.0]));
    let c = network.spawn_node(Vector::from_slice(&[180.0, 0.0]));
    network.run().expect("run");

    // Connectivity is strict: 90 < 100 connects, 180 does not.
    let degree = |id| {
        network
            .node(id)
            .and_then(|node| node.storage_value("degree"))
            .and_then(Value::as_int)
            .expect("degree written")
    };
    assert_eq!(degree(a), 1);
    assert_eq!(degree(b), 2);
    assert_eq!(degree(c), 1);
}

#[test]
fn first_round_sees_no_neighbor_exports() {
    let mut config = scripted_config(0.5);
    config.schema = StorageSchema::new().with("degree", ValueKind::Int);
    config.aggregators = vec![AggregatorSpec::new("degree", ReductionKind::Sum)];

    let mut network = Network::new(config, census_program()).expect("valid config");
    let a = network.spawn_node(Vector::from_slice(&[0.0, 0.0]));
    let b = network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.run().expect("run");

    // Only the t=0 round executed; nothing had been exported before it.
    for id in [a, b] {
        let node = network.node(id).expect("node");
        assert_eq!(node.rounds(), 1);
        assert_eq!(node.storage_value("degree"), Some(&Value::Int(0)));
    }
}

#[test]
fn neighbor_values_lag_one_round() {
    let mut config = scripted_config(3.0);
    config.schema = StorageSchema::new().with("observed", ValueKind::Int);
    config.aggregators = vec![AggregatorSpec::new("observed", ReductionKind::Max)];

    // Each node exports its completed-round count plus one and records the
    // largest value any neighbor has exported so far.
    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            let export = Value::Int(ctx.round() as i64 + 1);
            let field = ctx.share(CallPoint(0), export)?;
            let observed = field
                .iter()
                .filter_map(|(_, value)| value.as_int())
                .max()
                .unwrap_or(0);
            ctx.store("observed", Value::Int(observed))
        });

    let mut network = Network::new(config, program).expect("valid config");
    let a = network.spawn_node(Vector::from_slice(&[0.0, 0.0]));
    network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.run().expect("run");

    // The round at t=3 is the fourth round; the neighbor's visible export is
    // the one it published at t=2, during its third round.
    let node = network.node(a).expect("node");
    assert_eq!(node.rounds(), 4);
    assert_eq!(node.storage_value("observed"), Some(&Value::Int(3)));
}

#[test]
fn exports_expire_when_rounds_outpace_retention() {
    // Rounds every 3 seconds against a 2 second retention window: by the
    // time a node runs again, every neighbor export has already expired.
    let mut config = scripted_config(7.0);
    config.round_interval = IntervalSpec::Fixed(3.0);
    config.retention = 2.0;
    config.schema = StorageSchema::new().with("degree", ValueKind::Int);
    config.aggregators = vec![AggregatorSpec::new("degree", ReductionKind::Sum)];

    let mut network = Network::new(config, census_program()).expect("valid config");
    let a = network.spawn_node(Vector::from_slice(&[0.0, 0.0]));
    let b = network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.run().expect("run");

    for id in [a, b] {
        let node = network.node(id).expect("node");
        assert!(node.rounds() >= 3);
        assert_eq!(node.storage_value("degree"), Some(&Value::Int(0)));
    }
}

#[test]
fn old_carries_state_across_rounds() {
    let mut config = scripted_config(3.0);
    config.schema = StorageSchema::new().with("ticks", ValueKind::Int);
    config.aggregators = vec![AggregatorSpec::new("ticks", ReductionKind::Max)];

    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            let ticks = ctx.old(CallPoint(0), Value::Int(1), |previous| {
                Value::Int(previous.as_int().unwrap_or(0) + 1)
            })?;
            ctx.store("ticks", ticks)
        });

    let mut network = Network::new(config, program).expect("valid config");
    let id = network.spawn_node(Vector::from_slice(&[50.0, 50.0]));
    network.run().expect("run");

    // Rounds at t=0..=3: the initial value, then three updates.
    let node = network.node(id).expect("node");
    assert_eq!(node.rounds(), 4);
    assert_eq!(node.storage_value("ticks"), Some(&Value::Int(4)));
}

#[test]
fn gossip_max_propagates_hop_by_hop() {
    let mut config = scripted_config(4.0);
    config.schema = StorageSchema::new().with("seen_max", ValueKind::Real);
    config.aggregators = vec![AggregatorSpec::new("seen_max", ReductionKind::Min)];

    // Gossip the largest x coordinate seen anywhere in the network.
    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            let own = ctx.position().component(0);
            let seen = ctx.nbr(CallPoint(0), Value::Real(own), |field| {
                let best = field.max_real_with_local().unwrap_or(own).max(own);
                Value::Real(best)
            })?;
            ctx.store("seen_max", seen)
        });

    let mut network = Network::new(config, program).expect("valid config");
    let ids = [
        network.spawn_node(Vector::from_slice(&[0.0, 0.0])),
        network.spawn_node(Vector::from_slice(&[90.0, 0.0])),
        network.spawn_node(Vector::from_slice(&[180.0, 0.0])),
    ];
    network.run().expect("run");

    // Two hops separate the far ends, so two extra rounds suffice.
    for id in ids {
        let node = network.node(id).expect("node");
        assert_eq!(node.storage_value("seen_max"), Some(&Value::Real(180.0)));
    }
}

#[test]
fn velocity_moves_nodes_between_rounds() {
    let mut config = scripted_config(5.0);
    config.schema = StorageSchema::new().with("node_size", ValueKind::Real);

    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            ctx.set_velocity(Vector::from_slice(&[-1.0, 0.0]))?;
            ctx.store("node_size", Value::Real(1.0))
        });

    let mut network = Network::new(config, program).expect("valid config");
    let id = network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.run().expect("run");

    // Rounds at t=0..=5 integrate one unit of drift per second after t=0.
    let node = network.node(id).expect("node");
    assert!((node.position().component(0) - 5.0).abs() < 1e-9);
    assert!((node.position().component(1)).abs() < 1e-9);
}

#[test]
fn inconsistent_call_point_sequence_is_fatal() {
    let mut config = scripted_config(5.0);
    config.schema = StorageSchema::new().with("node_size", ValueKind::Real);

    // Switches call-points after the first round, which must abort the run.
    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            let call_point = if ctx.round() == 0 {
                CallPoint(0)
            } else {
                CallPoint(1)
            };
            ctx.old(call_point, Value::Int(0), |value| value)?;
            Ok(())
        });

    let mut network = Network::new(config, program).expect("valid config");
    network.spawn_node(Vector::from_slice(&[0.0, 0.0]));
    let err = network.run().expect_err("trace divergence must abort");
    assert!(matches!(err, KernelError::TraceMismatch { .. }), "{err}");
}

#[test]
fn shortened_call_point_sequence_is_fatal() {
    let mut config = scripted_config(5.0);
    config.schema = StorageSchema::new().with("node_size", ValueKind::Real);

    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            ctx.old(CallPoint(0), Value::Int(0), |value| value)?;
            if ctx.round() == 0 {
                ctx.old(CallPoint(1), Value::Int(0), |value| value)?;
            }
            Ok(())
        });

    let mut network = Network::new(config, program).expect("valid config");
    network.spawn_node(Vector::from_slice(&[0.0, 0.0]));
    let err = network.run().expect_err("truncated trace must abort");
    assert!(matches!(err, KernelError::TraceTruncated { .. }), "{err}");
}

#[test]
fn log_batches_reduce_storage_across_nodes() {
    let mut config = scripted_config(2.5);
    config.schema = StorageSchema::new().with("node_size", ValueKind::Real);
    config.aggregators = vec![
        AggregatorSpec::new("node_size", ReductionKind::Mean),
        AggregatorSpec::new("node_size", ReductionKind::Count),
    ];

    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            ctx.store("node_size", Value::Real(ctx.position().component(0)))
        });

    let mut network = Network::new(config, program).expect("valid config");
    network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.spawn_node(Vector::from_slice(&[30.0, 0.0]));
    network.run().expect("run");

    let batches: Vec<&LogBatch> = network.history().collect();
    assert_eq!(batches.len(), 3, "log events at t = 0, 1, 2");

    // Same-timestamp rounds run before the log event observes them.
    let first = batches[0];
    assert_eq!(first.node_count, 2);
    assert_eq!(first.records[0].value, Some(20.0));
    assert_eq!(first.records[0].samples, 2);
    assert_eq!(first.records[1].value, Some(2.0));
}

#[test]
fn aggregators_skip_nodes_without_the_tag() {
    let mut config = scripted_config(1.5);
    config.schema = StorageSchema::new().with("node_size", ValueKind::Real);

    // Never writes storage, so reductions have no samples.
    let program: Arc<dyn RoundProgram> =
        Arc::new(|_ctx: &mut RoundContext<'_>| -> Result<(), KernelError> { Ok(()) });

    let mut network = Network::new(config, program).expect("valid config");
    network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.run().expect("run");

    let first = network.history().next().expect("log batch");
    assert_eq!(first.records[0].value, None);
    assert_eq!(first.records[0].samples, 0);
}

#[test]
fn storage_persists_into_later_log_reductions() {
    let mut config = scripted_config(2.5);
    config.schema = StorageSchema::new().with("node_size", ValueKind::Real);

    // Writes the tag only on the first round; later reductions must still
    // see the persisted value.
    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            if ctx.round() == 0 {
                ctx.store("node_size", Value::Real(4.0))?;
            }
            Ok(())
        });

    let mut network = Network::new(config, program).expect("valid config");
    network.spawn_node(Vector::from_slice(&[10.0, 0.0]));
    network.run().expect("run");

    for batch in network.history() {
        assert_eq!(batch.records[0].value, Some(4.0), "at t = {}", batch.time.0);
        assert_eq!(batch.records[0].samples, 1);
    }
}

#[test]
fn synchronised_nodes_stay_in_lock_step() {
    let mut config = scripted_config(3.5);
    config.schema = StorageSchema::new().with("degree", ValueKind::Int);
    config.aggregators = vec![AggregatorSpec::new("degree", ReductionKind::Sum)];

    let mut network = Network::new(config, census_program()).expect("valid config");
    for i in 0..5 {
        network.spawn_node(Vector::from_slice(&[i as f64 * 40.0, 0.0]));
    }
    network.run().expect("run");

    for (_, node) in network.iter_nodes() {
        assert_eq!(node.rounds(), 4, "rounds at t = 0, 1, 2, 3");
    }
}

fn seeded_history(parallel: bool) -> Vec<LogBatch> {
    let config = KernelConfig {
        node_count: 30,
        max_time: Some(5.0),
        parallel,
        rng_seed: Some(42),
        ..KernelConfig::default()
    };
    let program: Arc<dyn RoundProgram> =
        Arc::new(|ctx: &mut RoundContext<'_>| -> Result<(), KernelError> {
            let field = ctx.share(CallPoint(0), Value::Real(1.0))?;
            ctx.store("node_size", Value::Real(field.len() as f64))
        });
    let mut network = Network::new(config, program).expect("valid config");
    network.run().expect("run");
    network.history().cloned().collect()
}

#[test]
fn seeded_runs_are_reproducible() {
    let first = seeded_history(true);
    let second = seeded_history(true);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn parallel_and_serial_execution_agree() {
    assert_eq!(seeded_history(true), seeded_history(false));
}
