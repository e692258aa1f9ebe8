use crate::models::{
    revision::RevisionState,
    upload_unit::{CachePolicy, NetworkPolicy, NewUploadUnit, Priority, UploadState},
};
use crate::services::{
    block_splitter::source_path, cache_mover::RevisionKey, failure::ErrorClass,
    remote::RemoteDrive, upload_pipeline::RunOutcome,
};
use crate::testutil::{DriveCall, TestEnv};
use tokio_util::sync::CancellationToken;

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Insert a unit with explicit retention and source deletion.
async fn unit_with(
    env: &TestEnv,
    uri: &str,
    name: &str,
    size: usize,
    cache_policy: CachePolicy,
    delete_source: bool,
) -> i64 {
    env.store
        .insert_unit(&NewUploadUnit {
            user_id: "alice".into(),
            volume_id: "vol".into(),
            parent_id: "photos".into(),
            source_uri: uri.into(),
            name: name.into(),
            size_bytes: size as i64,
            mime_type: "image/jpeg".into(),
            priority: Priority::User,
            network: NetworkPolicy::Any,
            delete_source,
            cache_policy,
            bulk_id: None,
        })
        .await
        .unwrap()
        .unit_id()
}

const NO_HISTORY: &str = "CREATE TRIGGER no_history BEFORE INSERT ON backup_history
     BEGIN SELECT RAISE(ABORT, 'disk full'); END";

#[tokio::test]
async fn resume_after_two_blocks_sends_only_the_third() {
    let env = TestEnv::new().await;
    let data = content(250);
    let uri = env.write_source("three.jpg", &data).await;
    let id = env.new_unit(&uri, "three.jpg", data.len()).await;
    let (pipeline, _events) = env.pipeline();
    let token = CancellationToken::new();

    env.remote.fail_block(Some(3));
    let err = pipeline.run(id, &token).await.unwrap_err();
    assert_eq!(err.source.class(), ErrorClass::Transient);
    assert_eq!(env.remote.transferred(), vec![1, 2]);

    let unit = env.store.get_unit(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UploadState::TransferringBlocks);
    assert_eq!(unit.block_count, Some(3));
    assert_eq!(env.store.count_pending_blocks(id).await.unwrap(), 1);

    env.remote.fail_block(None);
    env.remote.reset_counters();
    let encrypted = env.crypto.encryptions();
    let outcome = pipeline.run(id, &token).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed { attached: false });
    assert_eq!(env.remote.transferred(), vec![3]);
    assert_eq!(env.crypto.encryptions(), encrypted);
    assert!(env.store.get_unit(id).await.unwrap().is_none());

    let record = env
        .store
        .backup_record("alice", "photos", &uri)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.attached);
    let revision = record.revision_id.clone().unwrap();
    assert_eq!(env.remote.inner.revision_count(&record.link_id).await.unwrap(), 1);

    // Discard retention leaves nothing staged.
    let key = RevisionKey::new("alice", "vol", revision);
    assert!(!pipeline.mover().cache_path(&key).exists());
    assert!(!pipeline.mover().permanent_path(&key).exists());
}

#[tokio::test]
async fn missing_artifact_is_reencrypted_on_resume() {
    let env = TestEnv::new().await;
    let data = content(200);
    let uri = env.write_source("gone.jpg", &data).await;
    let id = env.new_unit(&uri, "gone.jpg", data.len()).await;
    let (pipeline, _events) = env.pipeline();
    let token = CancellationToken::new();

    env.remote.fail_block(Some(1));
    pipeline.run(id, &token).await.unwrap_err();
    let unit = env.store.get_unit(id).await.unwrap().unwrap();
    let key = RevisionKey::new("alice", "vol", unit.revision_id.clone().unwrap());
    tokio::fs::remove_file(pipeline.mover().artifact_path(&key, 1))
        .await
        .unwrap();

    env.remote.fail_block(None);
    let encrypted = env.crypto.encryptions();
    let outcome = pipeline.run(id, &token).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: false });
    assert_eq!(env.crypto.encryptions(), encrypted + 1);
}

#[tokio::test]
async fn existing_content_attaches_without_transfer() {
    let env = TestEnv::new().await;
    let data = content(300);
    let link_id = env.seed_remote_file("photos", "existing.jpg", &data).await;
    let uri = env.write_source("copy.jpg", &data).await;
    let id = env.new_unit(&uri, "copy.jpg", data.len()).await;
    let (pipeline, events) = env.pipeline();
    let mut rx = events.subscribe();

    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed { attached: true });
    assert_eq!(env.crypto.encryptions(), 0);
    assert_eq!(env.remote.bytes_transferred(), 0);
    assert_eq!(env.remote.inner.link_count().await.unwrap(), 1);
    let record = env
        .store
        .backup_record("alice", "photos", &uri)
        .await
        .unwrap()
        .unwrap();
    assert!(record.attached);
    assert_eq!(record.link_id, link_id);
    assert_eq!(record.bytes_sent, 0);

    let mut completed = false;
    while let Ok(event) = rx.try_recv() {
        if let crate::services::events::UploadEvent::Completed { attached, .. } = event {
            completed = attached;
        }
    }
    assert!(completed);
}

#[tokio::test]
async fn lost_commit_acknowledgement_does_not_duplicate_revision() {
    let env = TestEnv::new().await;
    let data = content(120);
    let uri = env.write_source("commit.jpg", &data).await;
    let id = env.new_unit(&uri, "commit.jpg", data.len()).await;
    let (pipeline, _events) = env.pipeline();
    let token = CancellationToken::new();

    env.remote.lose_commit_acks(1);
    let err = pipeline.run(id, &token).await.unwrap_err();
    assert_eq!(err.stage, UploadState::FinalizingRevision);

    let unit = env.store.get_unit(id).await.unwrap().unwrap();
    let link_id = unit.link_id.clone().unwrap();
    assert_eq!(unit.state, UploadState::FinalizingRevision);

    let outcome = pipeline.run(id, &token).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: false });
    assert_eq!(env.remote.inner.revision_count(&link_id).await.unwrap(), 1);
}

#[tokio::test]
async fn empty_file_commits_an_empty_manifest() {
    let env = TestEnv::new().await;
    let uri = env.write_source("empty.jpg", b"").await;
    let id = env.new_unit(&uri, "empty.jpg", 0).await;
    let (pipeline, _events) = env.pipeline();

    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: false });
    assert_eq!(env.crypto.encryptions(), 0);
    assert!(env.remote.transferred().is_empty());
    assert_eq!(env.remote.inner.link_count().await.unwrap(), 1);
}

#[tokio::test]
async fn keep_retention_promotes_artifacts() {
    let env = TestEnv::new().await;
    let data = content(95);
    let uri = env.write_source("keep.jpg", &data).await;
    let id = env
        .store
        .insert_unit(&NewUploadUnit {
            user_id: "alice".into(),
            volume_id: "vol".into(),
            parent_id: "photos".into(),
            source_uri: uri.clone(),
            name: "keep.jpg".into(),
            size_bytes: data.len() as i64,
            mime_type: "image/jpeg".into(),
            priority: Priority::User,
            network: NetworkPolicy::Any,
            delete_source: true,
            cache_policy: CachePolicy::Keep,
            bulk_id: None,
        })
        .await
        .unwrap()
        .unit_id();
    let (pipeline, _events) = env.pipeline();

    pipeline.run(id, &CancellationToken::new()).await.unwrap();

    let record = env
        .store
        .backup_record("alice", "photos", &uri)
        .await
        .unwrap()
        .unwrap();
    let key = RevisionKey::new("alice", "vol", record.revision_id.unwrap());
    assert!(pipeline.mover().permanent_path(&key).join("000002.blk").exists());
    assert!(!pipeline.mover().cache_path(&key).exists());
    assert!(!crate::services::block_splitter::source_path(&uri).exists());
}

#[tokio::test]
async fn name_taken_by_another_file_is_a_conflict() {
    let env = TestEnv::new().await;
    env.seed_remote_file("photos", "clash.jpg", b"other bytes").await;
    let uri = env.write_source("clash.jpg", b"new bytes").await;
    let id = env.new_unit(&uri, "clash.jpg", 9).await;
    let (pipeline, _events) = env.pipeline();

    let err = pipeline.run(id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage, UploadState::CreatingRemoteFile);
    assert_eq!(err.source.class(), ErrorClass::Conflict);
}

#[tokio::test]
async fn locked_folder_holds_the_unit_at_its_stage() {
    let env = TestEnv::new().await;
    let uri = env.write_source("held.jpg", b"held").await;
    let id = env.new_unit(&uri, "held.jpg", 4).await;
    let (pipeline, _events) = env.pipeline();

    env.crypto.lock_folder("photos");
    let err = pipeline.run(id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.source.class(), ErrorClass::Conditional);
    let unit = env.store.get_unit(id).await.unwrap().unwrap();
    assert_eq!(unit.state, UploadState::Unprocessed);

    env.crypto.unlock_folder("photos");
    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: false });
}

#[tokio::test]
async fn edited_source_becomes_a_new_revision_of_the_same_file() {
    let env = TestEnv::new().await;
    let (pipeline, _events) = env.pipeline();
    let first = content(150);
    let uri = env.write_source("edit.jpg", &first).await;
    let id = unit_with(&env, &uri, "edit.jpg", first.len(), CachePolicy::Keep, false).await;
    pipeline.run(id, &CancellationToken::new()).await.unwrap();
    let before = env
        .store
        .backup_record("alice", "photos", &uri)
        .await
        .unwrap()
        .unwrap();

    let edited: Vec<u8> = content(230).into_iter().rev().collect();
    env.write_source("edit.jpg", &edited).await;
    let id = unit_with(&env, &uri, "edit.jpg", edited.len(), CachePolicy::Keep, false).await;
    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: false });

    let after = env
        .store
        .backup_record("alice", "photos", &uri)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.link_id, before.link_id);
    assert_ne!(after.revision_id, before.revision_id);
    assert_eq!(env.remote.inner.link_count().await.unwrap(), 1);
    assert_eq!(env.remote.inner.revision_count(&after.link_id).await.unwrap(), 2);

    let old_revision = before.revision_id.unwrap();
    let superseded = env
        .remote
        .get_revision(&before.link_id, &old_revision)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(superseded.state, RevisionState::Obsolete);

    // The superseded offline copy goes back to the cache.
    let old_key = RevisionKey::new("alice", "vol", old_revision);
    assert!(pipeline.mover().cache_path(&old_key).exists());
    assert!(!pipeline.mover().permanent_path(&old_key).exists());
    let new_key = RevisionKey::new("alice", "vol", after.revision_id.unwrap());
    assert!(pipeline.mover().permanent_path(&new_key).exists());
}

#[tokio::test]
async fn cancelling_a_new_revision_keeps_the_backed_up_file() {
    let env = TestEnv::new().await;
    let (pipeline, _events) = env.pipeline();
    let uri = env.write_source("keep.jpg", &content(80)).await;
    let id = env.new_unit(&uri, "keep.jpg", 80).await;
    pipeline.run(id, &CancellationToken::new()).await.unwrap();
    let record = env
        .store
        .backup_record("alice", "photos", &uri)
        .await
        .unwrap()
        .unwrap();

    let edited = vec![1u8; 80];
    env.write_source("keep.jpg", &edited).await;
    let id = env.new_unit(&uri, "keep.jpg", edited.len()).await;
    env.remote.fail_block(Some(1));
    pipeline.run(id, &CancellationToken::new()).await.unwrap_err();
    env.remote.fail_block(None);
    assert_eq!(env.remote.inner.revision_count(&record.link_id).await.unwrap(), 2);

    env.store.request_cancel(id).await.unwrap();
    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(env.remote.inner.link_count().await.unwrap(), 1);
    assert_eq!(env.remote.inner.revision_count(&record.link_id).await.unwrap(), 1);
    let active = env
        .remote
        .get_revision(&record.link_id, record.revision_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.state, RevisionState::Active);
}

#[tokio::test]
async fn source_survives_when_attaching_cannot_be_recorded() {
    let env = TestEnv::new().await;
    let data = content(64);
    env.seed_remote_file("photos", "existing.jpg", &data).await;
    let uri = env.write_source("dup.jpg", &data).await;
    let id = unit_with(&env, &uri, "dup.jpg", data.len(), CachePolicy::Discard, true).await;
    let (pipeline, _events) = env.pipeline();

    sqlx::query(NO_HISTORY).execute(&*env.db).await.unwrap();
    let err = pipeline.run(id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage, UploadState::Unprocessed);
    assert!(source_path(&uri).exists());
    assert!(env.store.get_unit(id).await.unwrap().is_some());

    sqlx::query("DROP TRIGGER no_history").execute(&*env.db).await.unwrap();
    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: true });
    assert!(!source_path(&uri).exists());
}

#[tokio::test]
async fn source_survives_when_completion_cannot_be_recorded() {
    let env = TestEnv::new().await;
    let data = content(120);
    let uri = env.write_source("late.jpg", &data).await;
    let id = unit_with(&env, &uri, "late.jpg", data.len(), CachePolicy::Keep, true).await;
    let (pipeline, _events) = env.pipeline();

    sqlx::query(NO_HISTORY).execute(&*env.db).await.unwrap();
    let err = pipeline.run(id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage, UploadState::CleaningUp);
    assert!(source_path(&uri).exists());

    sqlx::query("DROP TRIGGER no_history").execute(&*env.db).await.unwrap();
    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { attached: false });
    assert!(!source_path(&uri).exists());
    assert!(
        env.store
            .backup_record("alice", "photos", &uri)
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn cancel_during_duplicate_check_records_nothing() {
    let env = TestEnv::new().await;
    let data = content(64);
    env.seed_remote_file("photos", "existing.jpg", &data).await;
    let uri = env.write_source("dup.jpg", &data).await;
    let id = unit_with(&env, &uri, "dup.jpg", data.len(), CachePolicy::Discard, true).await;
    let (pipeline, events) = env.pipeline();
    let mut rx = events.subscribe();

    let store = env.store.clone();
    env.remote.after(DriveCall::FindByHash, move || {
        Box::pin(async move {
            store.request_cancel(id).await.unwrap();
        })
    });

    let outcome = pipeline.run(id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert!(env.store.get_unit(id).await.unwrap().is_none());
    assert!(
        env.store
            .backup_record("alice", "photos", &uri)
            .await
            .unwrap()
            .is_none()
    );
    assert!(source_path(&uri).exists());
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(
            event,
            crate::services::events::UploadEvent::Completed { .. }
        ));
    }
}

#[tokio::test]
async fn source_rewritten_after_hashing_fails_the_upload() {
    let env = TestEnv::new().await;
    let data = content(120);
    let uri = env.write_source("moving.jpg", &data).await;
    let id = env.new_unit(&uri, "moving.jpg", data.len()).await;
    let (pipeline, _events) = env.pipeline();

    let path = source_path(&uri);
    env.remote.after(DriveCall::CreateDraft, move || {
        Box::pin(async move {
            tokio::fs::write(&path, vec![0u8; 120]).await.unwrap();
        })
    });

    let err = pipeline.run(id, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage, UploadState::EncryptingBlocks);
    assert_eq!(err.source.class(), ErrorClass::TerminalLocal);
    assert_eq!(env.store.count_pending_blocks(id).await.unwrap(), 0);
}
