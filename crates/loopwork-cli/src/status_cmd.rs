//! `loopwork status`: a read-only snapshot of the on-disk task store,
//! process registry, and checkpoint for one namespace -- no lock is taken,
//! since this never mutates anything.

use std::path::{Path, PathBuf};

use anyhow::Result;

use loopwork_core::checkpoint::CheckpointStore;
use loopwork_core::process::ProcessRegistry;
use loopwork_store::JsonTaskStore;

pub async fn run(state_dir: &Path, tasks_path: PathBuf, namespace: &str) -> Result<()> {
    let store = JsonTaskStore::new(tasks_path);
    let tasks = store.all().await?;

    let mut by_status: std::collections::BTreeMap<String, usize> = Default::default();
    for task in &tasks {
        *by_status.entry(task.status.to_string()).or_default() += 1;
    }
    println!("tasks: {} total", tasks.len());
    for (status, count) in &by_status {
        println!("  {status}: {count}");
    }

    let registry = ProcessRegistry::new(state_dir.join("processes.json"));
    let processes = registry.list_by_namespace(namespace).await?;
    println!("tracked processes in namespace {namespace:?}: {}", processes.len());

    let checkpoint_store = CheckpointStore::new(state_dir.to_path_buf());
    match checkpoint_store.load(namespace).await? {
        Some(snapshot) => {
            println!(
                "checkpoint: {} workers, {} completed iterations, {} interrupted task(s), started {}",
                snapshot.workers,
                snapshot.completed_iterations,
                snapshot.interrupted_tasks.len(),
                snapshot.started_at
            );
        }
        None => println!("checkpoint: none"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopwork_core::checkpoint::CheckpointSnapshot;
    use loopwork_core::process::ProcessRecord;
    use loopwork_test_utils::sample_task;

    #[tokio::test]
    async fn runs_clean_against_an_empty_project() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".loopwork")).unwrap();
        run(&dir.path().join(".loopwork"), dir.path().join("tasks.json"), "default")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reports_seeded_tasks_processes_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".loopwork");
        std::fs::create_dir_all(&state_dir).unwrap();

        let tasks_path = dir.path().join("tasks.json");
        let store = JsonTaskStore::new(tasks_path.clone());
        store.seed(vec![sample_task("t1"), sample_task("t2")]).await.unwrap();

        let registry = ProcessRegistry::new(state_dir.join("processes.json"));
        registry
            .add(ProcessRecord::new(std::process::id(), "agent", vec![], "default"))
            .await
            .unwrap();

        let checkpoint_store = CheckpointStore::new(state_dir.clone());
        checkpoint_store
            .save(&CheckpointSnapshot {
                workers: 2,
                completed_iterations: 1,
                interrupted_tasks: Default::default(),
                started_at: chrono::Utc::now(),
                namespace: "default".to_string(),
                session_id: "session-1".to_string(),
            })
            .await
            .unwrap();

        run(&state_dir, tasks_path, "default").await.unwrap();
    }
}
