//! DICe node binary.
//!
//! Runs one sensor node: the view synchronisation engine over an emulated
//! radio (UDP multicast), with a demo invariant over attribute 1 installed
//! at startup. Several instances on one host form a group.

use clap::Parser;
use dice::engine::{DissemMode, Engine, EngineConfig};
use dice::invariant::{InvNode, Invariant, InvariantSet, Mapping, MappingEntry, Operator};
use dice::node::{DEFAULT_PORT, Node, NodeConfig};
use dice::types::{NodeAddr, Objective, SignatureEntry, ViewSignature};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::net::Ipv4Addr;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "dice", version, about = "DICe: Distributed Invariants Checker")]
struct Args {
    /// Node address (two-byte identifier, unique per group member)
    #[arg(short, long)]
    addr: u16,

    /// UDP port of the emulated radio
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Multicast group standing in for the radio medium
    #[arg(short, long)]
    group: Option<Ipv4Addr>,

    /// Disseminated view form: t1 (violated-quantifier masks) or view
    /// (plain readings)
    #[arg(short, long, default_value = "t1")]
    mode: String,

    /// RNG seed for trickle jitter and the demo sensor
    #[arg(short, long)]
    seed: Option<u64>,

    /// Seconds before a new neighbour is announced to the group
    #[arg(long, default_value_t = dice::group::DEFAULT_NEW_NEIGHBOUR_LATENCY_SECS)]
    new_latency: u32,

    /// Seconds of silence before a member is evicted
    #[arg(long, default_value_t = dice::group::DEFAULT_MISSING_LATENCY_SECS)]
    missing_latency: u32,
}

/// The demo invariant: forall m, n over attribute 1, reading@m - reading@n
/// stays below 100. Quantifier 0 binds the maximize slice's best slot,
/// quantifier 1 the minimize slice's best slot.
fn demo_invariants() -> InvariantSet {
    let invariant = Invariant::new(
        vec![],
        vec![
            InvNode::attr(1, 0),
            InvNode::attr(1, 1),
            InvNode::op(Operator::MathMinus),
            InvNode::int(100),
            InvNode::op(Operator::CompLower),
        ],
    )
    .expect("demo invariant within bounds");

    let mapping = Mapping::new(vec![
        MappingEntry { attribute: 1, math_id: 0, quantifier: 0, index: 0 },
        MappingEntry { attribute: 1, math_id: 0, quantifier: 1, index: 2 },
    ]);

    // Disjunctive form: the node complies when its own reading is moderate
    // (below 60) or at least above 20.
    let disjunctions = vec![
        Invariant::new(
            vec![],
            vec![InvNode::attr(1, 0), InvNode::op(Operator::CompLower), InvNode::int(60)],
        )
        .expect("demo disjunct within bounds"),
        Invariant::new(
            vec![],
            vec![InvNode::attr(1, 0), InvNode::op(Operator::CompGreater), InvNode::int(20)],
        )
        .expect("demo disjunct within bounds"),
    ];

    InvariantSet::new(invariant, mapping, disjunctions).expect("demo set within bounds")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dice=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mode = match args.mode.as_str() {
        "t1" => DissemMode::Disjunctions,
        "view" => DissemMode::Readings,
        other => {
            error!(mode = other, "invalid mode, use: t1, view");
            return;
        }
    };

    let signature = ViewSignature::new(vec![
        SignatureEntry { attr: 1, objective: Objective::Maximize, slice_size: 2 },
        SignatureEntry { attr: 1, objective: Objective::Minimize, slice_size: 2 },
    ])
    .expect("demo signature within bounds");

    let seed = args.seed.unwrap_or(u64::from(args.addr));
    let cfg = EngineConfig {
        self_addr: NodeAddr(args.addr),
        signature,
        invariants: demo_invariants(),
        attribute_hashes: vec![1, 10, 11, 12],
        new_neighbour_latency_secs: args.new_latency,
        missing_latency_secs: args.missing_latency,
        mode,
        rng_seed: seed,
    };

    // Demo sensor: attribute 1 is a pseudo-random scalar, the auxiliary
    // attributes are fixed functions of their id.
    let mut sensor_rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5eed);
    let sensor =
        Box::new(move |hash: u16| if hash > 9 { hash + 1 } else { sensor_rng.gen_range(0..100) });

    let engine = match Engine::new(cfg, sensor) {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "engine configuration rejected");
            return;
        }
    };

    let mut node_cfg = NodeConfig { port: args.port, ..NodeConfig::default() };
    if let Some(group) = args.group {
        node_cfg.multicast_addr = group;
    }

    info!("DICe v{} on {}.{}", VERSION, args.addr >> 8, args.addr & 0xff);
    info!(port = node_cfg.port, group = %node_cfg.multicast_addr, mode = args.mode, "radio config");

    let node = match Node::bind(engine, &node_cfg) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "radio bind failed");
            return;
        }
    };

    tokio::select! {
        result = node.run() => {
            if let Err(err) = result {
                error!(%err, "node stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
