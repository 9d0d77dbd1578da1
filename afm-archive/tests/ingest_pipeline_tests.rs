//! Bulk ingestion integration tests

mod helpers;

use afm_archive::db::frames;
use afm_archive::models::FrameFilter;
use afm_common::events::ArchiveEvent;
use futures::TryStreamExt;
use helpers::{create_test_archive, create_test_archive_with, drain_events, minutes_after, FitsFrame};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_scan_moves_frames_into_repo_layout() {
    let t = create_test_archive().await;
    let source = t.source();
    let repo = t.archive.config.repo.clone();

    FitsFrame::light("M 31", "L", "2024-03-09T21:00:00").write_to(&source.join("night1/m31_001.fits"));
    FitsFrame::light("M 31", "L", "2024-03-09T21:05:00").write_to(&source.join("night1/m31_002.fit"));
    FitsFrame::dark(300.0, "2024-03-10T02:00:00").write_to(&source.join("darks/dark_001.FITS"));
    std::fs::write(source.join("night1/notes.txt"), b"seeing 2/5").unwrap();

    let mut rx = t.archive.events.subscribe();
    let report = t.archive.ingest_pipeline().run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.new, 3);
    assert_eq!(report.duplicates, 0);
    assert!(report.failed.is_empty());
    assert_eq!(report.skipped, 0);
    assert!(!report.cancelled);

    assert!(repo.join("M 31/light/2024-03-09/m31_001.fits").exists());
    assert!(repo.join("M 31/light/2024-03-09/m31_002.fit").exists());
    assert!(repo.join("Calibration/dark/2024-03-10/dark_001.FITS").exists());
    assert!(!source.join("night1/m31_001.fits").exists());
    assert!(!source.join("darks/dark_001.FITS").exists());
    assert!(source.join("night1/notes.txt").exists());

    let archived = repo.join("M 31/light/2024-03-09/m31_001.fits");
    let hash = afm_archive::services::hasher::hash_file(&archived).await.unwrap();
    let frame = t.archive.catalog.lookup(&hash).await.unwrap().unwrap();
    assert_eq!(frame.path, archived);

    let progress = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ArchiveEvent::IngestProgress { .. }))
        .count();
    assert_eq!(progress, 3);
}

#[tokio::test]
async fn test_duplicate_bytes_stay_in_intake() {
    let t = create_test_archive().await;
    let source = t.source();
    let frame = FitsFrame::light("M 42", "Ha", "2024-01-05T22:00:00");
    frame.write_to(&source.join("a.fits"));
    frame.write_to(&source.join("copy_of_a.fits"));

    let report = t.archive.ingest_pipeline().run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.scanned, 2);
    assert_eq!(report.new, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), 1);

    let left: Vec<_> = ["a.fits", "copy_of_a.fits"]
        .iter()
        .filter(|name| source.join(name).exists())
        .collect();
    assert_eq!(left.len(), 1);
}

#[tokio::test]
async fn test_second_scan_of_same_content_is_duplicate() {
    let t = create_test_archive().await;
    let source = t.source();
    let frame = FitsFrame::flat("L", "2024-01-06T05:00:00");
    frame.write_to(&source.join("flat.fits"));
    t.archive.ingest_pipeline().run(CancellationToken::new()).await.unwrap();

    frame.write_to(&source.join("flat.fits"));
    let report = t.archive.ingest_pipeline().run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.new, 0);
    assert_eq!(report.duplicates, 1);
    assert!(source.join("flat.fits").exists());
}

#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let t = create_test_archive().await;
    let source = t.source();
    for i in 0..5 {
        FitsFrame::bias(&minutes_after("2024-01-06T06:00:00", i))
            .write_to(&source.join(format!("bias_{:03}.fits", i)));
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = t.archive.ingest_pipeline().run(cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.scanned, 5);
    assert_eq!(report.new, 0);
    assert_eq!(report.skipped, 5);
    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), 0);
    assert!(source.join("bias_000.fits").exists());
}

#[tokio::test]
async fn test_cancel_mid_run_leaves_catalog_consistent() {
    let t = create_test_archive_with(|c| c.ingest_workers = 2).await;
    let source = t.source();
    let repo = t.archive.config.repo.clone();
    for i in 0..40 {
        FitsFrame::bias(&minutes_after("2024-01-06T06:00:00", i))
            .write_to(&source.join(format!("bias_{:03}.fits", i)));
    }

    // Interrupt as soon as the first file is reported done
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut rx = t.archive.events.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if matches!(event, ArchiveEvent::IngestProgress { .. }) {
                trigger.cancel();
                break;
            }
        }
    });

    let report = t.archive.ingest_pipeline().run(cancel).await.unwrap();
    listener.await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.scanned, 40);
    assert!(report.new > 0);
    assert!(report.skipped > 0);
    assert!(report.failed.is_empty());
    assert_eq!(report.new + report.duplicates + report.failed.len() + report.skipped, report.scanned);

    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), report.new as i64);
    let catalogued: Vec<_> = t
        .archive
        .catalog
        .query(FrameFilter::default())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(catalogued.len(), report.new);
    for frame in &catalogued {
        assert!(frame.path.starts_with(&repo), "{} not archived", frame.path.display());
        assert!(frame.path.exists(), "{} missing", frame.path.display());
    }

    let left_in_intake = std::fs::read_dir(&source).unwrap().count();
    assert_eq!(left_in_intake, report.skipped);
}

#[tokio::test]
async fn test_unreadable_files_are_reported() {
    let t = create_test_archive().await;
    let source = t.source();
    std::fs::write(source.join("broken.fits"), b"definitely not FITS").unwrap();
    FitsFrame::light("M 31", "L", "2024-03-09T21:00:00")
        .without("IMAGETYP")
        .write_to(&source.join("untyped.fits"));
    FitsFrame::bias("2024-01-06T06:00:00").write_to(&source.join("good.fits"));

    let report = t.archive.ingest_pipeline().run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.new, 1);
    let failed: Vec<_> = report
        .failed
        .iter()
        .map(|(path, _)| path.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(failed, vec!["broken.fits".to_string(), "untyped.fits".to_string()]);
    assert!(source.join("broken.fits").exists());
    assert!(source.join("untyped.fits").exists());
}

#[tokio::test]
async fn test_missing_source_directory_is_an_error() {
    let t = create_test_archive().await;
    std::fs::remove_dir_all(t.source()).unwrap();

    assert!(t.archive.ingest_pipeline().run(CancellationToken::new()).await.is_err());
}
