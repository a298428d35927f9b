//! Two nodes sharing a remote tier and an invalidation bus.

use hybrid_cache_kit::{
    backend::InMemoryBackend, bus::InMemoryTransport, error::Result, CacheBackend, HybridCache,
    HybridCacheConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Example entity: Employment
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Employment {
    id: String,
    employer_name: String,
    salary: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Hybrid Cache Kit - Two Nodes ===\n");

    // 1. Shared infrastructure: one remote tier, one bus
    println!("1. Starting two nodes over a shared remote tier...");
    let remote = InMemoryBackend::new();
    let transport = InMemoryTransport::new();

    let node_a = HybridCache::builder(InMemoryBackend::new(), remote.clone(), transport.clone())
        .config(HybridCacheConfig::new("employment").with_node_id("node-a"))
        .build()
        .await?;
    let node_b = HybridCache::builder(InMemoryBackend::new(), remote, transport)
        .config(HybridCacheConfig::new("employment").with_node_id("node-b"))
        .build()
        .await?;
    println!("   ✓ node-a and node-b subscribed\n");

    // 2. Write on node A
    println!("2. node-a writes employment:emp_001");
    let employment = Employment {
        id: "emp_001".to_string(),
        employer_name: "Acme Corp".to_string(),
        salary: 75000.0,
    };
    node_a
        .set("employment:emp_001", &employment, Duration::from_secs(60))
        .await?;
    node_a.flush_publishes().await?;
    println!("   ✓ Written to remote, then node-a local\n");

    // 3. Read on node B: remote hit, promoted into node B's local tier
    println!("3. node-b reads employment:emp_001");
    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Some(emp) = node_b.get::<Employment>("employment:emp_001").await? {
        println!(
            "   ✓ {} at {} (${:.2}), promoted: {}\n",
            emp.id,
            emp.employer_name,
            emp.salary,
            node_b.local().exists("employment:emp_001").await?
        );
    }

    // 4. Update on node A evicts node B's copy
    println!("4. node-a raises the salary");
    let raised = Employment {
        salary: 82000.0,
        ..employment
    };
    node_a
        .set("employment:emp_001", &raised, Duration::from_secs(60))
        .await?;
    node_a.flush_publishes().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    println!(
        "   ✓ node-b local copy evicted: {}",
        !node_b.local().exists("employment:emp_001").await?
    );
    if let Some(emp) = node_b.get::<Employment>("employment:emp_001").await? {
        println!("   ✓ node-b now reads ${:.2}\n", emp.salary);
    }

    // 5. Remove everywhere
    println!("5. node-a removes the entry");
    node_a.remove("employment:emp_001").await?;
    node_a.flush_publishes().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let gone = node_b.get::<Employment>("employment:emp_001").await?.is_none();
    println!("   ✓ node-b sees it gone: {}\n", gone);

    println!(
        "Published by node-a: {}, failed: {}",
        node_a.publish_stats().published(),
        node_a.publish_stats().failed()
    );
    println!("=== Example Complete ===\n");

    Ok(())
}
