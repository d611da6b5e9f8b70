//! Forms a ring on loopback, stores a few keys and reads them back from every member.
//!
//! Run: `cargo run --example ring -- --nodes 10`

use std::time::Instant;

use ringdht::{topology, Id, Node};

use clap::Parser;

use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes joining the seed
    #[arg(short, long, default_value_t = 10)]
    nodes: usize,
    /// Port of the seed node, 0 lets the OS pick one
    #[arg(short, long, default_value_t = 0)]
    port: u16,
    /// Number of keys to store
    #[arg(short, long, default_value_t = 5)]
    keys: usize,
    /// Compute finger tables once the ring is formed
    #[arg(short, long)]
    fingers: bool,
}

fn main() -> ringdht::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    let seed = Node::builder().port(cli.port).start()?;
    println!("Seed {} listening on {:?}", seed.peer(), seed.local_addr());

    let start = Instant::now();
    let mut nodes = Vec::with_capacity(cli.nodes);
    for _ in 0..cli.nodes {
        let node = Node::builder().start()?;
        node.join(seed.peer())?;
        nodes.push(node);
    }
    println!(
        "Joined {} nodes in {:?} seconds",
        nodes.len(),
        start.elapsed().as_secs_f32()
    );

    let members = topology::network_nodes(&seed, seed.peer())?;
    println!("\n=== RING ({} members) ===", members.len());
    for member in &members {
        println!("{member}");
    }

    if cli.fingers {
        for node in std::iter::once(&seed).chain(nodes.iter()) {
            let fingers = node.update_fingers()?;
            println!("{} has {} fingers", node.peer(), fingers.len());
        }
    }

    println!("\n=== STORAGE ===");
    for i in 0..cli.keys {
        let key = Id::from_key(&format!("key {i}"));
        let value = format!("value {i}");

        let writer = nodes.get(i % nodes.len().max(1)).unwrap_or(&seed);
        writer.put(key, &value)?;

        let owner = seed.find_closest(&key)?;
        let read = writer.get::<String>(key)?;
        println!("{key} -> {read:?}, owned by {owner}");
    }

    Ok(())
}
