//! `loopwork cleanup`: a standalone orphan sweep against the process
//! registry, for an operator who wants to reap stale subprocesses without
//! starting a full engine run (e.g. after a machine came back from a crash).

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use loopwork_core::process::{OrphanDetector, ProcessRegistry};

pub async fn run(state_dir: &Path, task_timeout: Duration, grace_period: Duration) -> Result<()> {
    let registry = ProcessRegistry::new(state_dir.join("processes.json"));
    // scan_interval is irrelevant for a one-shot sweep; only scan_once is used.
    let detector = OrphanDetector::new(Duration::from_secs(300), task_timeout, grace_period);

    let before = registry.list().await?;
    if before.is_empty() {
        println!("no tracked processes");
        return Ok(());
    }

    let reaped = detector.scan_once(&registry).await?;
    println!("scanned {} tracked process(es), reaped {}", before.len(), reaped.len());
    for pid in &reaped {
        println!("  reaped pid {pid}");
    }
    Ok(())
}
