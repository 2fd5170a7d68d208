//! Treeline benchmark harness
//!
//! Loads a ruleset (and optionally a packet trace), builds the classifier,
//! replays the trace for throughput numbers with miss accounting, then
//! drives a random insert/delete phase over the ruleset.
//!
//! # Usage
//!
//! ```bash
//! treeline -r acl_10k -p acl_10k_trace
//! treeline -r acl_10k -p acl_10k_trace -b 16 --bits 2 --trials 5
//! treeline -r acl_10k --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use treeline_common::{loader, LoaderResult, Packet, Rule};
use treeline_engine::{Classifier, ClassifierConfig, UpdateOp};

#[derive(Parser)]
#[command(name = "treeline")]
#[command(version = "0.1.0")]
#[command(about = "Decision-tree forest packet classifier benchmark", long_about = None)]
struct Cli {
    /// Rule set file path
    #[arg(short = 'r', long)]
    rules: PathBuf,

    /// Packet trace file path
    #[arg(short = 'p', long)]
    trace: Option<PathBuf>,

    /// Leaf node capacity
    #[arg(short = 'b', long, default_value_t = 8)]
    binth: usize,

    /// Max split bits per tree level
    #[arg(long = "bits", default_value_t = 4)]
    max_bits: usize,

    /// Max number of trees
    #[arg(short = 't', long = "trees", default_value_t = 32)]
    max_trees: usize,

    /// Max tree depth
    #[arg(short = 'l', long = "level", default_value_t = 6)]
    max_level: u32,

    /// Wildcard side-storage threshold (default: auto from ruleset size)
    #[arg(long)]
    wrs_threshold: Option<usize>,

    /// Trace replay count
    #[arg(long, default_value_t = 10)]
    trials: usize,

    /// Random update operations to run (default: one per rule)
    #[arg(long)]
    update_ops: Option<usize>,

    /// Skip the random update phase
    #[arg(long, default_value_t = false)]
    no_updates: bool,

    /// Emit the structure summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> LoaderResult<()> {
    let rules = loader::load_rules_file(&cli.rules)?;
    tracing::info!(path = %cli.rules.display(), count = rules.len(), "loaded ruleset");

    let config = ClassifierConfig {
        max_bits: cli.max_bits,
        max_level: cli.max_level,
        binth: cli.binth,
        max_trees: cli.max_trees,
        wrs_threshold: cli
            .wrs_threshold
            .unwrap_or_else(|| ClassifierConfig::recommended_wrs_threshold(rules.len(), cli.binth)),
        ..Default::default()
    };

    println!("=== Treeline Construction ===");
    println!(
        "Parameters: maxBits={}, maxLevel={}, binth={}, maxTrees={}, wrsThreshold={}",
        config.max_bits, config.max_level, config.binth, config.max_trees, config.wrs_threshold
    );
    println!("Rules loaded: {}\n", rules.len());

    let mut classifier = Classifier::new(config);
    let start = Instant::now();
    classifier.construct(rules.clone());
    let construction = start.elapsed();

    println!("Construct classifier");
    println!(
        "\tConstruction time: {:.3} ms",
        construction.as_secs_f64() * 1e3
    );
    println!(
        "\tTotal memory size: {} KB",
        classifier.mem_size_bytes() / 1024
    );
    println!("\tNumber of trees: {}", classifier.num_tables());
    println!(
        "\tAverage leaf depth: {:.2}",
        classifier.average_leaf_depth()
    );
    println!(
        "\tAverage node balance: {:.3} (1 = perfect)",
        classifier.average_node_balance()
    );
    println!(
        "\tOverflow container rules: {}\n",
        classifier.overflow_rule_count()
    );

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&classifier.structure_summary())
                .expect("summary serializes")
        );
    }

    if let Some(trace_path) = &cli.trace {
        let packets = loader::load_trace_file(trace_path)?;
        replay_trace(&classifier, &rules, &packets, cli.trials);
    }

    if !cli.no_updates && !rules.is_empty() {
        let count = cli.update_ops.unwrap_or(rules.len()).min(rules.len());
        run_update_phase(&mut classifier, &rules[..count]);
    }

    Ok(())
}

fn replay_trace(classifier: &Classifier, rules: &[Rule], packets: &[Packet], trials: usize) {
    if packets.is_empty() {
        println!("Trace file holds no packets\n");
        return;
    }
    let trials = trials.max(1);
    println!("Classify trace");
    println!(
        "\tTotal packets (run {} times circularly): {}",
        trials,
        packets.len() * trials
    );

    let rule_count = rules.len() as i32;
    let mut misses = 0usize;
    let mut total = std::time::Duration::ZERO;

    for _ in 0..trials {
        let start = Instant::now();
        for packet in packets {
            let priority = classifier.classify(packet);
            // Priorities run N-1..0 in file order, so the matched rule id
            // is their mirror image.
            let matched_id = rule_count - 1 - priority;
            if let Some(expected) = packet.expected_id {
                if priority < 0 || matched_id as u32 > expected {
                    misses += 1;
                }
            }
        }
        total += start.elapsed();
    }

    let per_packet_us = total.as_secs_f64() * 1e6 / (trials * packets.len()) as f64;
    println!(
        "\t{} packets classified, {} misclassified",
        packets.len() * trials,
        misses
    );
    println!(
        "\tTotal classification time: {:.6} s",
        total.as_secs_f64() / trials as f64
    );
    println!("\tAverage classification time: {per_packet_us:.6} us");
    println!("\tThroughput: {:.6} Mpps\n", 1.0 / per_packet_us);
}

fn run_update_phase(classifier: &mut Classifier, rules: &[Rule]) {
    println!("Update classifier");
    println!("\tRules in update set: {}", rules.len());

    let mut rng = rand::thread_rng();
    let ops: Vec<UpdateOp> = (0..rules.len())
        .map(|_| {
            if rng.gen::<bool>() {
                UpdateOp::Insert
            } else {
                UpdateOp::Delete
            }
        })
        .collect();

    let start = Instant::now();
    let stats = classifier.apply_updates(rules, &ops);
    let elapsed = start.elapsed();

    println!(
        "\tInsert success rate: {}/{} ({:.1}%)",
        stats.insert_successes,
        stats.insert_attempts,
        rate(stats.insert_successes, stats.insert_attempts)
    );
    println!(
        "\tDelete success rate: {}/{} ({:.1}%)",
        stats.delete_successes,
        stats.delete_attempts,
        rate(stats.delete_successes, stats.delete_attempts)
    );
    let per_op_us = elapsed.as_secs_f64() * 1e6 / rules.len().max(1) as f64;
    println!("\tTotal update time: {:.6} s", elapsed.as_secs_f64());
    println!("\tAverage update time: {per_op_us:.6} us");
    println!("\tThroughput: {:.6} Mops\n", 1.0 / per_op_us);
}

fn rate(successes: u32, attempts: u32) -> f64 {
    if attempts == 0 {
        0.0
    } else {
        100.0 * successes as f64 / attempts as f64
    }
}
