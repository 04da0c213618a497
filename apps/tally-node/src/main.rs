//! # Tally Node
//!
//! A standalone CLI walkthrough of Tally counter replication. Every node owns
//! a redb-backed counter store and talks to its peers over the in-memory
//! transport, so the whole cluster runs inside one process.
//!
//! ## Replication round (push)
//!
//! ```text
//! A ── LastEtagRequest(wire name of A) ──▶ B      "where do you have me?"
//! A ◀──────── LastEtagResponse(n) ─────────  B
//! A ── Replicate(changes after n) ────────▶ B      repeated until drained
//! A ◀──────── ReplicateAck(checkpoint) ────  B
//! ```

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use tally_replication::{
    create_network, MemoryTransport, ReplicationConfig, ReplicationNode, ReplicationReceiver,
    ReplicationSender, ReplicationTransport, Result,
};
use tally_store::{CounterStore, NodeName, StoreConfigBuilder};
use tracing_subscriber::EnvFilter;

type Node = ReplicationNode<MemoryTransport>;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tally-node")]
#[command(about = "Replicated PN-counter walkthrough (Tally)")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log: String,

    /// Keep node stores on disk under this directory instead of in memory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Basic demo: two nodes increment, push to each other, and converge
    Demo,
    /// Conflict scenario: batches from 3 nodes applied in different orders and twice
    Conflict,
    /// Network partition simulation: split, independent work, heal, full convergence
    Partition,
}

// ─── Cluster setup ─────────────────────────────────────────────────────────

async fn start_cluster(names: &[&str], data_dir: Option<&Path>) -> Result<Vec<Arc<Node>>> {
    let names = names
        .iter()
        .map(|name| NodeName::new(*name))
        .collect::<tally_store::Result<Vec<_>>>()?;

    let mut nodes = Vec::with_capacity(names.len());
    for transport in create_network(&names) {
        let name = transport.local_name().clone();
        let builder = StoreConfigBuilder::new().node_name(name.as_str());
        let config = match data_dir {
            Some(dir) => builder
                .path(dir.join(format!("{}.redb", name.wire_name())))
                .build(),
            None => builder.in_memory().build(),
        };

        let store = Arc::new(CounterStore::open(config)?);
        let node = Arc::new(ReplicationNode::new(
            store,
            Arc::new(transport),
            ReplicationConfig::default(),
        ));
        node.spawn()?;
        tracing::info!(node = %name, durable = data_dir.is_some(), "node started");
        nodes.push(node);
    }
    Ok(nodes)
}

/// Counter name → total, as seen by one store.
fn totals(store: &CounterStore) -> Result<BTreeMap<String, i64>> {
    let reader = store.create_reader()?;
    Ok(reader
        .counters()?
        .into_iter()
        .map(|counter| (counter.name().to_string(), counter.total()))
        .collect())
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

async fn push(from: &Node, to: &Node) -> Result<()> {
    let summary = from.push_to(to.name()).await?;
    let detail = if summary.batches == 0 {
        format!("nothing new after etag {}", summary.resumed_from)
    } else {
        format!(
            "from etag {}: {} counter(s) in {} batch(es), checkpoint {}",
            summary.resumed_from, summary.counters, summary.batches, summary.acknowledged
        )
    };
    println!(
        "  {} {} {} {}  {}",
        from.name().as_str().bright_magenta(),
        "──push──▶".bright_cyan(),
        to.name().as_str().bright_magenta(),
        "✓".bright_green(),
        detail.dimmed()
    );
    Ok(())
}

fn show_store(store: &CounterStore) -> Result<()> {
    let border = "─".repeat(56);
    let reader = store.create_reader()?;

    println!("  ┌{}┐", border);
    println!(
        "  │ {:^54} │",
        format!("Node: {}", store.node_name()).bright_yellow().to_string()
    );
    println!("  ├{}┤", border);

    let counters = reader.counters()?;
    if counters.is_empty() {
        println!("  │ {:^54} │", "(no counters)".dimmed().to_string());
    }
    for counter in &counters {
        let mut parts = Vec::new();
        for value in counter.values().values() {
            let source = reader
                .source_name(value.source_id)?
                .unwrap_or_else(|| value.source_id.to_string());
            if value.negative > 0 {
                parts.push(format!("{}:+{}-{}", source, value.positive, value.negative));
            } else {
                parts.push(format!("{}:+{}", source, value.positive));
            }
        }
        let line = format!(
            "{:<14} = {:>5}  ({})",
            counter.name(),
            counter.total(),
            parts.join(", ")
        );
        println!("  │ {:<54} │", line);
    }

    let checkpoints = reader.checkpoints()?;
    if !checkpoints.is_empty() {
        println!("  ├{}┤", border);
        for checkpoint in checkpoints {
            let source = reader
                .source_name(checkpoint.source_id)?
                .unwrap_or_else(|| checkpoint.source_id.to_string());
            let line = format!("checkpoint {:<24} @ etag {}", source, checkpoint.etag);
            println!("  │ {:<54} │", line.dimmed().to_string());
        }
    }
    println!("  └{}┘", border);
    Ok(())
}

fn convergence_check(stores: &[&CounterStore]) -> Result<bool> {
    let mut views = stores.iter().map(|store| totals(store));
    let base = match views.next() {
        Some(view) => view?,
        None => return Ok(true),
    };
    for view in views {
        if view? != base {
            return Ok(false);
        }
    }
    Ok(true)
}

fn convergence_result(converged: bool) {
    if converged {
        println!(
            "\n  {} {}",
            "✓".bright_green().bold(),
            "ALL NODES CONVERGED: totals are identical"
                .bright_green()
                .bold()
        );
    } else {
        println!(
            "\n  {} {}",
            "✗".bright_red().bold(),
            "DIVERGENCE DETECTED: nodes differ".bright_red().bold()
        );
    }
}

// ─── Demo ──────────────────────────────────────────────────────────────────

async fn run_demo(data_dir: Option<&Path>) -> Result<()> {
    header("DEMO: Local Increments & Anti-Entropy Push");

    let nodes = start_cluster(&["alice", "bob"], data_dir).await?;
    let (alice, bob) = (&nodes[0], &nodes[1]);

    section("Phase 1: Two nodes increment independently");
    alice.increment("page_views", 5).await?;
    step("alice: page_views += 5");
    alice.increment("page_views", 3).await?;
    step("alice: page_views += 3  (total contribution: 8)");

    bob.increment("page_views", 10).await?;
    step("bob:   page_views += 10");
    bob.increment("likes", 2).await?;
    step("bob:   likes += 2");

    show_store(alice.store())?;
    show_store(bob.store())?;

    section("Phase 2: Push in both directions");
    push(alice, bob).await?;
    push(bob, alice).await?;

    section("Phase 3: Post-sync state");
    show_store(alice.store())?;
    show_store(bob.store())?;
    convergence_result(convergence_check(&[alice.store().as_ref(), bob.store().as_ref()])?);

    section("Phase 4: Pushing again resumes from the checkpoint");
    push(alice, bob).await?;
    alice.increment("likes", 1).await?;
    step("alice: likes += 1");
    push(alice, bob).await?;

    section("Final values");
    step(&format!(
        "page_views = {} (alice:8 + bob:10)",
        bob.total("page_views").await?
    ));
    step(&format!("likes = {} (bob:2 + alice:1)", bob.total("likes").await?));
    if let Some(dir) = data_dir {
        step(&format!(
            "stores kept under {}; run again to add to these totals",
            dir.display()
        ));
    }
    Ok(())
}

// ─── Conflict ──────────────────────────────────────────────────────────────

fn run_conflict() -> Result<()> {
    header("CONFLICT: Concurrent Updates, Delivery-Order Independence");

    section("Phase 1: Three nodes make concurrent edits to the same counters");
    let n1 = Arc::new(CounterStore::in_memory("node-1")?);
    let n2 = Arc::new(CounterStore::in_memory("node-2")?);
    let n3 = Arc::new(CounterStore::in_memory("node-3")?);

    n1.increment("score", 100)?;
    n1.decrement("score", 10)?;
    step("node-1: score += 100, score -= 10");

    n2.increment("score", 50)?;
    n2.increment("bonus", 25)?;
    step("node-2: score += 50, bonus += 25");

    n3.increment("score", 75)?;
    n3.decrement("score", 5)?;
    n3.increment("bonus", 10)?;
    step("node-3: score += 75, score -= 5, bonus += 10");

    let mut batches = Vec::new();
    for store in [&n1, &n2, &n3] {
        if let Some(batch) = ReplicationSender::new(store.clone(), 100).next_batch(0)? {
            batches.push(batch);
        }
    }
    step(&format!("{} outgoing batches prepared", batches.len()));

    section("Phase 2: Deliver the batches in 3 different orders");
    let orders: [(&str, [usize; 3]); 3] = [
        ("order-A", [0, 1, 2]),
        ("order-B", [2, 0, 1]),
        ("order-C", [1, 2, 0]),
    ];

    let mut observers = Vec::new();
    for (name, order) in orders {
        let store = Arc::new(CounterStore::in_memory(name)?);
        let receiver = ReplicationReceiver::new(store.clone());
        for idx in order {
            if let Some(batch) = batches.get(idx) {
                receiver.receive(batch)?;
            }
        }
        step(&format!(
            "{} ({:?}): score={}, bonus={}",
            name,
            order,
            store.total("score")?,
            store.total("bonus")?
        ));
        observers.push(store);
    }

    section("Delivery-order independence");
    let views: Vec<&CounterStore> = observers.iter().map(|store| store.as_ref()).collect();
    convergence_result(convergence_check(&views)?);
    step(&format!(
        "score = {} (100+50+75 − 10−5 = 210)",
        observers[0].total("score")?
    ));
    step(&format!("bonus = {} (25+10 = 35)", observers[0].total("bonus")?));

    section("Phase 3: Idempotence: redelivering the same batch");
    let receiver = ReplicationReceiver::new(observers[0].clone());
    let before = observers[0].total("score")?;
    if let Some(batch) = batches.first() {
        let ack = receiver.receive(batch)?;
        let after = observers[0].total("score")?;
        if !ack.applied && before == after {
            step(&format!(
                "Idempotent ✓  score stayed {}, checkpoint for {} stayed {}",
                after, batch.sending_node_name, ack.checkpoint
            ));
        } else {
            step(&format!("IDEMPOTENCE FAILURE: {} → {} ✗", before, after));
        }
    }
    Ok(())
}

// ─── Partition ─────────────────────────────────────────────────────────────

async fn run_partition(data_dir: Option<&Path>) -> Result<()> {
    header("PARTITION: Network Split, Independent Work, Heal & Converge");

    section("Phase 1: Create 4 nodes in 2 data-centers, establish shared baseline");
    let nodes = start_cluster(
        &[
            "http://east-1:7000",
            "http://east-2:7000",
            "http://west-1:7000",
            "http://west-2:7000",
        ],
        data_dir,
    )
    .await?;
    let (east, west) = nodes.split_at(2);

    east[0].increment("requests", 100).await?;
    for peer in nodes.iter().skip(1) {
        push(&east[0], peer).await?;
    }
    step("Baseline: requests = 100, pushed to all 4 nodes");

    section("Phase 2: NETWORK PARTITION");
    for e in east {
        for w in west {
            e.transport().disconnect_from(w.transport());
        }
    }
    println!(
        "  {}   {}",
        "╔══════════════════╗".bright_blue(),
        "╔══════════════════╗".bright_red()
    );
    println!(
        "  {}   {}",
        "║  EAST DC         ║".bright_blue(),
        "║  WEST DC         ║".bright_red()
    );
    println!(
        "  {}   {}",
        "║  east-1, east-2  ║".bright_blue(),
        "║  west-1, west-2  ║".bright_red()
    );
    println!(
        "  {}   {}",
        "╚══════════════════╝".bright_blue(),
        "╚══════════════════╝".bright_red()
    );
    println!("  {}", "         ╳╳╳ PARTITION ╳╳╳".bright_red().bold());

    if let Err(err) = east[0].push_to(west[0].name()).await {
        step(&format!("east-1 → west-1 fails as expected: {}", err));
    }

    east[0].increment("requests", 50).await?;
    east[0].increment("errors", 3).await?;
    east[1].increment("requests", 30).await?;
    east[1].increment("errors", -1).await?;
    push(&east[0], &east[1]).await?;
    push(&east[1], &east[0]).await?;
    step("East: east-1 +50 req, +3 err; east-2 +30 req, −1 err correction");

    west[0].increment("requests", 200).await?;
    west[0].increment("latency_spikes", 7).await?;
    west[1].increment("requests", 150).await?;
    west[1].increment("latency_spikes", 3).await?;
    push(&west[0], &west[1]).await?;
    push(&west[1], &west[0]).await?;
    step("West: west-1 +200 req, +7 spikes; west-2 +150 req, +3 spikes");

    section("Pre-heal state");
    show_store(east[0].store())?;
    show_store(west[0].store())?;

    section("Phase 3: PARTITION HEALS");
    for e in east {
        for w in west {
            e.transport().connect_to(w.transport());
        }
    }
    println!("  {}", "         ════ HEALED ════".bright_green().bold());

    for node in &nodes {
        for summary in node.push_to_all().await {
            if summary.batches > 0 {
                step(&format!(
                    "{} → {}: resumed at etag {}, {} counter(s)",
                    node.name(),
                    summary.peer,
                    summary.resumed_from,
                    summary.counters
                ));
            }
        }
    }

    section("Phase 4: Post-heal state");
    show_store(east[0].store())?;
    show_store(west[0].store())?;

    let stores: Vec<&CounterStore> = nodes.iter().map(|node| node.store().as_ref()).collect();
    convergence_result(convergence_check(&stores)?);

    step(&format!(
        "requests       = {} (100+50+30+200+150 = 530)",
        west[1].total("requests").await?
    ));
    step(&format!(
        "errors         = {} (3−1 = 2)",
        west[1].total("errors").await?
    ));
    step(&format!(
        "latency_spikes = {} (7+3 = 10)",
        east[1].total("latency_spikes").await?
    ));
    Ok(())
}

// ─── Entry point ───────────────────────────────────────────────────────────

fn init_tracing(level: &str) {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    let data_dir = cli.data_dir.as_deref();
    let result = match cli.command {
        Commands::Demo => run_demo(data_dir).await,
        Commands::Conflict => run_conflict(),
        Commands::Partition => run_partition(data_dir).await,
    };

    if let Err(err) = result {
        eprintln!("{} {}", "error:".bright_red().bold(), err);
        std::process::exit(1);
    }
}
