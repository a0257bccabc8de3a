use midrender::dispatch::dispatcher::{resubmit_job, submit_job};
use midrender::manifest::JobManifest;
use midrender::store::{ChunkState, JobState, Store};
use midrender::FarmError;
use tempfile::TempDir;

fn open_store(dir: &TempDir) -> Store {
    Store::open(&dir.path().join("farm.db")).unwrap()
}

fn manifest(job_id: &str) -> JobManifest {
    manifest_with(job_id, 1, 10, 3, 3, &[])
}

fn manifest_with(
    job_id: &str,
    frame_start: i32,
    frame_end: i32,
    chunk_size: i32,
    max_retries: i32,
    tags_required: &[&str],
) -> JobManifest {
    JobManifest {
        job_id: job_id.into(),
        template_id: "blender-cycles".into(),
        submitted_by: "alice".into(),
        submitted_at_ms: 1_700_000_000_000,
        frame_start,
        frame_end,
        chunk_size,
        max_retries,
        timeout_seconds: None,
        output_dir: None,
        tags_required: tags_required.iter().map(|t| t.to_string()).collect(),
        command: serde_json::json!("render {frame_start} {frame_end}"),
    }
}

fn tags(list: &[&str]) -> Vec<String> {
    list.iter().map(|t| t.to_string()).collect()
}

/// I1-I5 over every chunk of a job.
fn assert_chunk_invariants(store: &Store, job_id: &str, max_retries: i32) {
    for chunk in store.chunks_for_job(job_id).unwrap() {
        assert!(chunk.frame_start <= chunk.frame_end);
        match chunk.state {
            ChunkState::Pending => {
                assert!(chunk.assigned_to.is_none(), "pending chunk has assignee");
                assert!(chunk.assigned_at_ms.is_none());
            }
            ChunkState::Assigned => {
                assert!(chunk.assigned_to.is_some(), "assigned chunk lacks assignee");
                assert!(chunk.assigned_at_ms.is_some());
            }
            _ => {}
        }
        for frame in &chunk.completed_frames {
            assert!(*frame >= chunk.frame_start && *frame <= chunk.frame_end);
        }
        let mut sorted = chunk.completed_frames.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, chunk.completed_frames, "frames not sorted/distinct");

        if matches!(chunk.state, ChunkState::Pending | ChunkState::Assigned) {
            assert!(chunk.retry_count <= max_retries);
        }
        let mut nodes = chunk.failed_on.clone();
        nodes.sort();
        nodes.dedup();
        assert_eq!(nodes.len(), chunk.failed_on.len(), "duplicate blacklist entry");
    }
}

#[test]
fn submission_partitions_the_frame_range() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    let chunks = store.chunks_for_job("shot-010").unwrap();
    let ranges: Vec<(i32, i32)> = chunks.iter().map(|c| (c.frame_start, c.frame_end)).collect();
    assert_eq!(ranges, vec![(1, 3), (4, 6), (7, 9), (10, 10)]);
    assert!(chunks.iter().all(|c| c.state == ChunkState::Pending));
    assert!(chunks.iter().all(|c| c.assigned_to.is_none()));
    assert_chunk_invariants(&store, "shot-010", 3);
}

#[test]
fn duplicate_job_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    submit_job(&store, &manifest("shot-010"), 50).unwrap();
    let duplicate = submit_job(&store, &manifest("shot-010"), 50);
    assert!(matches!(duplicate, Err(FarmError::AlreadyExists(_))));
}

#[test]
fn invalid_manifests_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let inverted = manifest_with("bad", 10, 1, 3, 3, &[]);
    assert!(matches!(
        submit_job(&store, &inverted, 50),
        Err(FarmError::Validation(_))
    ));
    assert!(store.job("bad").unwrap().is_none());
}

#[test]
fn assignment_is_a_conditional_transition() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    let (chunk, _) = store
        .find_next_pending_for_node(&[], "node-a")
        .unwrap()
        .unwrap();
    assert!(store.assign_chunk(chunk.id, "node-a", 1000).unwrap());

    // Exactly one assignment wins; a second attempt on the same chunk fails.
    assert!(!store.assign_chunk(chunk.id, "node-b", 1001).unwrap());

    let chunks = store.chunks_for_job("shot-010").unwrap();
    let assigned = chunks.iter().find(|c| c.id == chunk.id).unwrap();
    assert_eq!(assigned.state, ChunkState::Assigned);
    assert_eq!(assigned.assigned_to.as_deref(), Some("node-a"));
    assert_eq!(assigned.assigned_at_ms, Some(1000));
    assert_chunk_invariants(&store, "shot-010", 3);
}

#[test]
fn completion_requires_assigned_state_and_snaps_frames() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    // Not assigned yet: completion is a no-op.
    assert!(!store.complete_chunk("shot-010", 1, 3, 2000).unwrap());

    let (chunk, _) = store
        .find_next_pending_for_node(&[], "node-a")
        .unwrap()
        .unwrap();
    store.assign_chunk(chunk.id, "node-a", 1000).unwrap();
    assert!(store.complete_chunk("shot-010", 1, 3, 2000).unwrap());

    let chunks = store.chunks_for_job("shot-010").unwrap();
    let done = &chunks[0];
    assert_eq!(done.state, ChunkState::Completed);
    assert_eq!(done.completed_at_ms, Some(2000));
    assert_eq!(done.completed_frames, vec![1, 2, 3]);
    assert_chunk_invariants(&store, "shot-010", 3);
}

#[test]
fn retry_walks_the_blacklist_until_terminal_failure() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest_with("solo", 1, 1, 1, 2, &[]), 50).unwrap();

    // Node A takes the chunk and fails it: back to pending, A blacklisted.
    let (chunk, _) = store.find_next_pending_for_node(&[], "A").unwrap().unwrap();
    store.assign_chunk(chunk.id, "A", 100).unwrap();
    store.fail_chunk("solo", 1, 1, 2, "A").unwrap();

    let chunks = store.chunks_for_job("solo").unwrap();
    assert_eq!(chunks[0].state, ChunkState::Pending);
    assert_eq!(chunks[0].failed_on, vec!["A".to_string()]);
    assert_eq!(chunks[0].retry_count, 1);
    assert_chunk_invariants(&store, "solo", 2);

    // A is blacklisted now, B is not.
    assert!(store.find_next_pending_for_node(&[], "A").unwrap().is_none());
    let (chunk, _) = store.find_next_pending_for_node(&[], "B").unwrap().unwrap();
    store.assign_chunk(chunk.id, "B", 200).unwrap();

    // B also fails: the retry budget is exhausted, the chunk is terminal.
    store.fail_chunk("solo", 1, 1, 2, "B").unwrap();
    let chunks = store.chunks_for_job("solo").unwrap();
    assert_eq!(chunks[0].state, ChunkState::Failed);
    assert_eq!(chunks[0].failed_on, tags(&["A", "B"]));
    assert_eq!(chunks[0].retry_count, 2);
    assert_chunk_invariants(&store, "solo", 2);
}

#[test]
fn blacklist_append_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest_with("solo", 1, 1, 1, 10, &[]), 50).unwrap();

    store.fail_chunk("solo", 1, 1, 10, "A").unwrap();
    store.fail_chunk("solo", 1, 1, 10, "A").unwrap();

    let chunks = store.chunks_for_job("solo").unwrap();
    assert_eq!(chunks[0].failed_on, vec!["A".to_string()]);
    assert_eq!(chunks[0].retry_count, 2);
}

#[test]
fn tag_requirements_filter_dispatch() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest_with("gpu-job", 1, 5, 5, 3, &["gpu"]), 50).unwrap();

    // No tags: the job is invisible.
    assert!(store
        .find_next_pending_for_node(&[], "node-a")
        .unwrap()
        .is_none());
    // Wrong tags: still invisible.
    assert!(store
        .find_next_pending_for_node(&tags(&["cpu"]), "node-a")
        .unwrap()
        .is_none());
    // Superset of required tags: eligible.
    let found = store
        .find_next_pending_for_node(&tags(&["cpu", "gpu"]), "node-a")
        .unwrap();
    assert!(found.is_some());
}

#[test]
fn dispatch_order_follows_priority_then_submission_time() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let mut urgent = manifest_with("urgent", 1, 3, 3, 3, &[]);
    urgent.submitted_at_ms = 2_000;
    let mut routine = manifest_with("routine", 1, 3, 3, 3, &[]);
    routine.submitted_at_ms = 1_000;

    submit_job(&store, &routine, 80).unwrap();
    submit_job(&store, &urgent, 10).unwrap();

    // Lower priority value wins even though it was submitted later.
    let (chunk, found) = store.find_next_pending_for_node(&[], "n").unwrap().unwrap();
    assert_eq!(found.job_id, "urgent");

    // The query is deterministic: repeated calls return the same chunk.
    let (again, _) = store.find_next_pending_for_node(&[], "n").unwrap().unwrap();
    assert_eq!(chunk.id, again.id);
}

#[test]
fn paused_jobs_are_not_dispatched() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    store.update_job_state("shot-010", JobState::Paused).unwrap();
    assert!(store.find_next_pending_for_node(&[], "n").unwrap().is_none());

    store.update_job_state("shot-010", JobState::Active).unwrap();
    assert!(store.find_next_pending_for_node(&[], "n").unwrap().is_some());
}

#[test]
fn dead_worker_reassignment_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    for _ in 0..3 {
        let (chunk, _) = store.find_next_pending_for_node(&[], "X").unwrap().unwrap();
        store.assign_chunk(chunk.id, "X", 100).unwrap();
    }

    assert_eq!(store.reassign_dead_worker("X").unwrap(), 3);
    let chunks = store.chunks_for_job("shot-010").unwrap();
    assert_eq!(
        chunks.iter().filter(|c| c.state == ChunkState::Pending).count(),
        4
    );
    assert!(chunks.iter().all(|c| c.retry_count == 0));
    assert_chunk_invariants(&store, "shot-010", 3);

    // Second call finds nothing left to reassign.
    assert_eq!(store.reassign_dead_worker("X").unwrap(), 0);
}

#[test]
fn frame_reports_are_idempotent_and_sorted() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    store.add_completed_frames("shot-010", &[5, 2]).unwrap();
    store.add_completed_frames("shot-010", &[2, 4]).unwrap();

    let chunks = store.chunks_for_job("shot-010").unwrap();
    // Frames 2 is in chunk 1-3; 4 and 5 in chunk 4-6.
    assert_eq!(chunks[0].completed_frames, vec![2]);
    assert_eq!(chunks[1].completed_frames, vec![4, 5]);
    assert_chunk_invariants(&store, "shot-010", 3);

    // Frames outside every chunk are ignored.
    store.add_completed_frames("shot-010", &[99]).unwrap();
    let chunks = store.chunks_for_job("shot-010").unwrap();
    assert!(chunks.iter().all(|c| !c.completed_frames.contains(&99)));
}

#[test]
fn revert_undoes_assignment_without_blacklist_or_retry_cost() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    let (chunk, _) = store.find_next_pending_for_node(&[], "X").unwrap().unwrap();
    store.assign_chunk(chunk.id, "X", 100).unwrap();
    assert!(store.revert_chunk("shot-010", chunk.frame_start, chunk.frame_end).unwrap());

    let chunks = store.chunks_for_job("shot-010").unwrap();
    let reverted = chunks.iter().find(|c| c.id == chunk.id).unwrap();
    assert_eq!(reverted.state, ChunkState::Pending);
    assert_eq!(reverted.retry_count, 0);
    assert!(reverted.failed_on.is_empty());
    assert!(reverted.assigned_to.is_none());

    // The node that never received the work can be offered it again.
    let (again, _) = store.find_next_pending_for_node(&[], "X").unwrap().unwrap();
    assert_eq!(again.id, chunk.id);
}

#[test]
fn retry_failed_restores_budget_but_keeps_blacklist() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest_with("solo", 1, 1, 1, 1, &[]), 50).unwrap();

    store.add_completed_frames("solo", &[1]).unwrap();
    store.fail_chunk("solo", 1, 1, 1, "A").unwrap();
    let chunks = store.chunks_for_job("solo").unwrap();
    assert_eq!(chunks[0].state, ChunkState::Failed);
    store.update_job_state("solo", JobState::Completed).unwrap();

    assert_eq!(store.retry_failed_chunks("solo").unwrap(), 1);
    let chunks = store.chunks_for_job("solo").unwrap();
    assert_eq!(chunks[0].state, ChunkState::Pending);
    assert_eq!(chunks[0].retry_count, 0);
    assert!(chunks[0].completed_frames.is_empty());
    assert_eq!(chunks[0].failed_on, vec!["A".to_string()]);

    // The job is dispatchable again.
    let job = store.job("solo").unwrap().unwrap();
    assert_eq!(job.current_state, JobState::Active);
}

#[test]
fn reset_all_chunks_requeues_from_scratch() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    let (chunk, _) = store.find_next_pending_for_node(&[], "A").unwrap().unwrap();
    store.assign_chunk(chunk.id, "A", 100).unwrap();
    store.complete_chunk("shot-010", 1, 3, 200).unwrap();
    store.fail_chunk("shot-010", 4, 6, 1, "B").unwrap();

    assert!(store.reset_all_chunks("shot-010").unwrap());
    let chunks = store.chunks_for_job("shot-010").unwrap();
    for chunk in &chunks {
        assert_eq!(chunk.state, ChunkState::Pending);
        assert_eq!(chunk.retry_count, 0);
        assert!(chunk.completed_frames.is_empty());
        assert!(chunk.failed_on.is_empty());
        assert!(chunk.assigned_to.is_none());
        assert!(chunk.completed_at_ms.is_none());
    }
}

#[test]
fn job_is_complete_iff_every_chunk_is_terminal() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest_with("two", 1, 2, 1, 1, &[]), 50).unwrap();

    assert!(!store.is_job_complete("two").unwrap());

    let (chunk, _) = store.find_next_pending_for_node(&[], "A").unwrap().unwrap();
    store.assign_chunk(chunk.id, "A", 100).unwrap();
    store.complete_chunk("two", 1, 1, 200).unwrap();
    assert!(!store.is_job_complete("two").unwrap());

    // A terminally failed chunk also counts toward completion.
    store.fail_chunk("two", 2, 2, 1, "A").unwrap();
    assert!(store.is_job_complete("two").unwrap());
}

#[test]
fn summaries_aggregate_chunk_states() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    let (chunk, _) = store.find_next_pending_for_node(&[], "A").unwrap().unwrap();
    store.assign_chunk(chunk.id, "A", 100).unwrap();
    store.complete_chunk("shot-010", 1, 3, 200).unwrap();
    let (chunk, _) = store.find_next_pending_for_node(&[], "A").unwrap().unwrap();
    store.assign_chunk(chunk.id, "A", 300).unwrap();

    let summaries = store.job_summaries().unwrap();
    assert_eq!(summaries.len(), 1);
    let progress = &summaries[0].progress;
    assert_eq!(progress.total, 4);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.rendering, 1);
    assert_eq!(progress.pending, 2);
    assert_eq!(progress.failed, 0);
}

#[test]
fn delete_job_cascades_to_chunks() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();

    assert!(store.delete_job("shot-010").unwrap());
    assert!(store.job("shot-010").unwrap().is_none());
    assert!(store.chunks_for_job("shot-010").unwrap().is_empty());
}

#[test]
fn priority_updates_change_dispatch_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest_with("first", 1, 1, 1, 3, &[]), 50).unwrap();
    submit_job(&store, &manifest_with("second", 1, 1, 1, 3, &[]), 50).unwrap();

    store.update_job_priority("second", 1).unwrap();
    let (_, found) = store.find_next_pending_for_node(&[], "n").unwrap().unwrap();
    assert_eq!(found.job_id, "second");
}

#[test]
fn snapshot_then_restore_preserves_the_dispatch_view() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 50).unwrap();
    submit_job(&store, &manifest_with("gpu-job", 1, 4, 2, 2, &["gpu"]), 10).unwrap();

    // Node A carries the gpu tag, so the urgent gpu job is offered first.
    let (chunk, found) = store
        .find_next_pending_for_node(&tags(&["gpu"]), "A")
        .unwrap()
        .unwrap();
    assert_eq!(found.job_id, "gpu-job");
    store.assign_chunk(chunk.id, "A", 100).unwrap();
    store.add_completed_frames("shot-010", &[1, 2]).unwrap();

    let snapshot = dir.path().join("state").join("snapshot.db");
    store.snapshot_to(&snapshot).unwrap();

    // The source keeps writing after the snapshot; the copy is frozen.
    store.complete_chunk("gpu-job", 1, 2, 500).unwrap();

    let restored = Store::restore_from(&snapshot, &dir.path().join("restored.db")).unwrap();
    let summaries = restored.job_summaries().unwrap();
    assert_eq!(summaries.len(), 2);
    let frames_restored = &restored.chunks_for_job("shot-010").unwrap()[0];
    assert_eq!(frames_restored.completed_frames, vec![1, 2]);

    for job_id in ["shot-010", "gpu-job"] {
        let restored_chunks = restored.chunks_for_job(job_id).unwrap();
        assert!(!restored_chunks.is_empty());
        if job_id == "gpu-job" {
            // The post-snapshot completion is not in the copy.
            assert!(restored_chunks.iter().all(|c| c.state == ChunkState::Assigned
                || c.state == ChunkState::Pending));
        }
    }

    // Assigned chunks survive the restore until the worker is observed dead.
    let gpu_chunks = restored.chunks_for_job("gpu-job").unwrap();
    assert_eq!(gpu_chunks[0].assigned_to.as_deref(), Some("A"));
    restored.reassign_dead_worker("A").unwrap();
    assert_eq!(
        restored.chunks_for_job("gpu-job").unwrap()[0].state,
        ChunkState::Pending
    );
}

#[test]
fn restore_rejects_a_torn_snapshot() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("snapshot.db");
    std::fs::write(&snapshot, b"not a database at all").unwrap();

    let restored = Store::restore_from(&snapshot, &dir.path().join("restored.db"));
    assert!(restored.is_err());
}

#[test]
fn reopening_a_store_is_idempotent_migration() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        submit_job(&store, &manifest("shot-010"), 50).unwrap();
    }
    // Second open re-runs schema creation over the existing file.
    let store = open_store(&dir);
    assert!(store.job("shot-010").unwrap().is_some());
    assert_eq!(store.chunks_for_job("shot-010").unwrap().len(), 4);
}

#[test]
fn resubmission_derives_fresh_versioned_ids() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    submit_job(&store, &manifest("shot-010"), 40).unwrap();

    // Dirty the original so we can see the copy start clean.
    store.fail_chunk("shot-010", 1, 3, 1, "A").unwrap();

    let second = resubmit_job(&store, "shot-010").unwrap();
    assert_eq!(second, "shot-010-v2");
    let third = resubmit_job(&store, "shot-010-v2").unwrap();
    assert_eq!(third, "shot-010-v3");

    let copy = store.job("shot-010-v2").unwrap().unwrap();
    assert_eq!(copy.priority, 40);
    let copy_chunks = store.chunks_for_job("shot-010-v2").unwrap();
    assert_eq!(copy_chunks.len(), 4);
    assert!(copy_chunks.iter().all(|c| c.state == ChunkState::Pending));
    assert!(copy_chunks.iter().all(|c| c.failed_on.is_empty()));

    let missing = resubmit_job(&store, "nope");
    assert!(matches!(missing, Err(FarmError::JobNotFound(_))));
}

#[test]
fn manifest_round_trips_through_the_job_row() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let original = manifest_with("shot-010", 1, 100, 7, 5, &["gpu", "fast"]);
    submit_job(&store, &original, 50).unwrap();

    let row = store.job("shot-010").unwrap().unwrap();
    assert_eq!(row.manifest().unwrap(), original);
}
