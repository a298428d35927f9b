//! Cache-aside with stampede protection and the method decorator.

use hybrid_cache_kit::{
    backend::InMemoryBackend, bus::InMemoryTransport, error::Result, lock::InMemoryLockBackend,
    CacheAside, CacheStrategy, DistributedLockFactory, HybridCache, HybridCacheConfig, TtlPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Serialize, Deserialize, Debug)]
struct Report {
    quarter: String,
    revenue: u64,
}

/// Mock repository that simulates a slow database
struct ReportRepository {
    queries: AtomicU32,
}

impl ReportRepository {
    async fn fetch(&self, quarter: &str) -> Result<Report> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        println!("  [DB] Computing report: {}", quarter);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Report {
            quarter: quarter.to_string(),
            revenue: 1_250_000,
        })
    }
}

fn ttl_by_prefix(prefix: &str) -> Duration {
    match prefix {
        "report" => Duration::from_secs(3600),
        _ => Duration::from_secs(60),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init()
        .ok();

    println!("\n=== Hybrid Cache Kit - Cache Aside ===\n");

    let cache = HybridCache::builder(
        InMemoryBackend::new(),
        InMemoryBackend::new(),
        InMemoryTransport::new(),
    )
    .config(HybridCacheConfig::new("reports"))
    .build()
    .await?;

    let aside = CacheAside::new(cache)
        .with_ttl_policy(TtlPolicy::PerType(ttl_by_prefix))
        .with_lock(DistributedLockFactory::new(InMemoryLockBackend::new()), 2_000);
    let repo = Arc::new(ReportRepository {
        queries: AtomicU32::new(0),
    });

    // 1. Ten concurrent misses, one computation
    println!("1. Ten concurrent requests for report:2024-q1");
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let aside = aside.clone();
        let repo = Arc::clone(&repo);
        tasks.push(tokio::spawn(async move {
            aside
                .get_or_compute("report:2024-q1", || async move { repo.fetch("2024-q1").await })
                .await
        }));
    }
    for task in tasks {
        if let Ok(Ok(report)) = task.await {
            println!("   ✓ {} revenue {}", report.quarter, report.revenue);
        }
    }
    println!(
        "   ✓ Database queried {} time(s)\n",
        repo.queries.load(Ordering::SeqCst)
    );

    // 2. Builder: force a refresh with retries
    println!("2. Invalidate strategy with retries");
    let report: Option<Report> = aside
        .operation("report:2024-q1")
        .with_strategy(CacheStrategy::Invalidate)
        .with_retry(2)
        .execute(|| repo.fetch("2024-q1"))
        .await?;
    if let Some(report) = report {
        println!("   ✓ Refreshed {}\n", report.quarter);
    }

    // 3. Method decorator
    println!("3. Decorated method");
    let by_quarter = aside.method("report", "by_quarter");
    let report: Report = by_quarter
        .call(&[&"2024-q2"], || repo.fetch("2024-q2"))
        .await?;
    println!(
        "   ✓ {} cached under {}",
        report.quarter,
        by_quarter.key(&[&"2024-q2"])
    );
    by_quarter.evict(&[&"2024-q2"]).await?;
    println!("   ✓ Evicted\n");

    println!("=== Example Complete ===\n");

    Ok(())
}
