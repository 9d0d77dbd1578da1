//! Storage tier lifecycle integration tests

mod helpers;

use afm_archive::models::{CalibrationRefs, ContentHash, Subject, TierState};
use afm_archive::ArchiveError;
use afm_common::events::ArchiveEvent;
use helpers::{create_test_archive, create_test_archive_with, drain_events, minutes_after, FitsFrame, TestArchive};
use std::time::Duration;

async fn ingested_light(t: &TestArchive) -> (Subject, std::path::PathBuf) {
    let frame = t
        .ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00"))
        .await;
    (Subject::Frame(frame.hash.clone()), frame.path)
}

fn tier_transitions(events: &[ArchiveEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|e| match e {
            ArchiveEvent::TierChanged { from, to, .. } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect()
}

fn pair(from: &str, to: &str) -> (String, String) {
    (from.to_string(), to.to_string())
}

#[tokio::test]
async fn test_upload_verify_soft_delete_lifecycle() {
    let t = create_test_archive().await;
    let (subject, path) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;
    assert_eq!(tiering.state(&subject).await.unwrap(), TierState::Local);

    let location = tiering.begin_upload(&subject).await.unwrap();
    assert_eq!(
        tiering.state(&subject).await.unwrap(),
        TierState::CloudPending { location: location.clone() }
    );

    let verified = tiering.verify(&subject).await.unwrap();
    assert_eq!(verified, TierState::CloudVerified { url: location.clone() });
    assert!(path.exists());

    let deleted = tiering.soft_delete(&subject).await.unwrap();
    assert_eq!(deleted, TierState::SoftDeleted { url: location.clone() });
    assert!(!path.exists());
    assert!(std::path::Path::new(&location).exists());

    let orphaned: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM fitsfile WHERE soft_delete = 1 AND cloud_url IS NULL")
            .fetch_one(&t.archive.pool)
            .await
            .unwrap();
    assert_eq!(orphaned, 0);

    let Subject::Frame(hash) = &subject else { unreachable!() };
    let frame = t.archive.catalog.lookup(hash).await.unwrap().unwrap();
    assert!(frame.tier.is_soft_deleted());
    assert_eq!(frame.tier.cloud_url(), Some(location.as_str()));
}

#[tokio::test]
async fn test_soft_delete_refused_without_verified_copy() {
    let t = create_test_archive().await;
    let (subject, path) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;

    assert!(matches!(
        tiering.soft_delete(&subject).await,
        Err(ArchiveError::TransitionRefused { .. })
    ));
    assert_eq!(tiering.state(&subject).await.unwrap(), TierState::Local);
    assert!(path.exists());

    tiering.begin_upload(&subject).await.unwrap();
    let pending = tiering.state(&subject).await.unwrap();
    assert!(matches!(
        tiering.soft_delete(&subject).await,
        Err(ArchiveError::TransitionRefused { .. })
    ));
    assert_eq!(tiering.state(&subject).await.unwrap(), pending);
    assert!(path.exists());
}

#[tokio::test]
async fn test_verify_requires_pending_upload() {
    let t = create_test_archive().await;
    let (subject, _) = ingested_light(&t).await;

    assert!(matches!(
        t.archive.tiering.verify(&subject).await,
        Err(ArchiveError::TransitionRefused { .. })
    ));
    assert_eq!(t.cloud.verifies(), 0);
}

#[tokio::test]
async fn test_verify_retries_after_mismatch() {
    let t = create_test_archive().await;
    let (subject, _) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;
    let mut rx = t.archive.events.subscribe();

    tiering.begin_upload(&subject).await.unwrap();
    t.cloud.fail_next_verifications(2);
    let state = tiering.verify_with_retry(&subject, 3).await.unwrap();

    assert!(matches!(state, TierState::CloudVerified { .. }));
    assert_eq!(t.cloud.uploads(), 3);
    assert_eq!(t.cloud.verifies(), 3);
    assert_eq!(
        tier_transitions(&drain_events(&mut rx)),
        vec![
            pair("local", "cloud_pending"),
            pair("cloud_pending", "cloud_pending"),
            pair("cloud_pending", "cloud_pending"),
            pair("cloud_pending", "cloud_verified"),
        ]
    );
}

#[tokio::test]
async fn test_mismatch_leaves_record_pending() {
    let t = create_test_archive().await;
    let (subject, _) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;

    tiering.begin_upload(&subject).await.unwrap();
    t.cloud.fail_next_verifications(5);

    assert!(matches!(
        tiering.verify_with_retry(&subject, 2).await,
        Err(ArchiveError::VerificationMismatch { .. })
    ));
    assert!(matches!(
        tiering.state(&subject).await.unwrap(),
        TierState::CloudPending { .. }
    ));
}

#[tokio::test]
async fn test_corrupted_remote_blocks_soft_delete() {
    let t = create_test_archive().await;
    let (subject, path) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;

    let location = tiering.begin_upload(&subject).await.unwrap();
    tiering.verify(&subject).await.unwrap();
    std::fs::write(&location, b"bit rot").unwrap();

    assert!(matches!(
        tiering.soft_delete(&subject).await,
        Err(ArchiveError::VerificationMismatch { .. })
    ));
    assert_eq!(
        tiering.state(&subject).await.unwrap(),
        TierState::CloudVerified { url: location }
    );
    assert!(path.exists());
}

#[tokio::test]
async fn test_verify_timeout_leaves_record_pending() {
    let t = create_test_archive_with(|c| c.verify_timeout_secs = 1).await;
    let (subject, _) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;

    tiering.begin_upload(&subject).await.unwrap();
    t.cloud.set_verify_delay(Duration::from_secs(3));

    assert!(matches!(
        tiering.verify(&subject).await,
        Err(ArchiveError::Timeout { .. })
    ));
    assert!(matches!(
        tiering.state(&subject).await.unwrap(),
        TierState::CloudPending { .. }
    ));
}

#[tokio::test]
async fn test_upload_refused_once_verified() {
    let t = create_test_archive().await;
    let (subject, _) = ingested_light(&t).await;
    let tiering = &t.archive.tiering;

    tiering.begin_upload(&subject).await.unwrap();
    tiering.verify(&subject).await.unwrap();

    assert!(matches!(
        tiering.begin_upload(&subject).await,
        Err(ArchiveError::TransitionRefused { .. })
    ));
    assert_eq!(t.cloud.uploads(), 1);
}

#[tokio::test]
async fn test_unknown_subject_not_found() {
    let t = create_test_archive().await;
    let subject = Subject::Frame(ContentHash::of_bytes(b"never seen"));

    assert!(matches!(
        t.archive.tiering.state(&subject).await,
        Err(ArchiveError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_master_moves_through_tiers() {
    let t = create_test_archive().await;
    let darks = t
        .ingest_many(3, |i| FitsFrame::dark(300.0, &minutes_after("2024-03-10T02:00:00", i as i64)))
        .await;
    let master = t
        .archive
        .synthesizer
        .synthesize(darks[0].session_id.unwrap())
        .await
        .unwrap();
    let subject: Subject = format!("master:{}", master.id).parse().unwrap();
    let tiering = &t.archive.tiering;

    tiering.begin_upload(&subject).await.unwrap();
    tiering.verify(&subject).await.unwrap();
    let state = tiering.soft_delete(&subject).await.unwrap();

    assert!(state.is_soft_deleted());
    assert!(!master.path.exists());
    let stored = afm_archive::db::masters::load_master(&t.archive.pool, master.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.is_current());

    // A soft-deleted master is no longer offered to light sessions
    let light = t
        .ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00"))
        .await;
    let resolution = t
        .archive
        .resolver
        .resolve(light.session_id.unwrap(), afm_archive::models::CalibrationRole::Dark)
        .await
        .unwrap();
    assert!(matches!(resolution, afm_archive::services::Resolution::Unresolved));
}

#[tokio::test]
async fn test_verified_original_url_reaches_calibrated_frames() {
    let t = create_test_archive().await;
    let light = t
        .ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00"))
        .await;
    let darks = t
        .ingest_many(2, |i| FitsFrame::dark(300.0, &minutes_after("2024-03-10T02:00:00", i as i64)))
        .await;
    let master = t
        .archive
        .synthesizer
        .synthesize(darks[0].session_id.unwrap())
        .await
        .unwrap();

    let derived_path = t.dir.path().join("calibrated.fits");
    std::fs::write(&derived_path, b"calibrated light").unwrap();
    let derived = ContentHash::of_bytes(b"calibrated light");
    t.archive
        .catalog
        .register_calibrated(
            &light.hash,
            &derived,
            &derived_path,
            &CalibrationRefs {
                dark: Some(master.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let subject = Subject::Frame(light.hash.clone());
    let location = t.archive.tiering.begin_upload(&subject).await.unwrap();
    t.archive.tiering.verify(&subject).await.unwrap();

    let calibrated = t.archive.catalog.lookup(&derived).await.unwrap().unwrap();
    assert_eq!(calibrated.calibration.original_cloud_url.as_deref(), Some(location.as_str()));
}
