//! Frame catalog and session grouping integration tests

mod helpers;

use afm_archive::db::{frames, sessions};
use afm_archive::models::{
    CalibrationRefs, ContentHash, FrameFilter, FrameType, IngestOutcome, MasterId,
};
use afm_archive::ArchiveError;
use afm_common::events::ArchiveEvent;
use futures::TryStreamExt;
use helpers::{create_test_archive, drain_events, minutes_after, FitsFrame};

#[tokio::test]
async fn test_ingest_same_content_twice_yields_one_row() {
    let t = create_test_archive().await;
    let light = FitsFrame::light("M 31", "L", "2024-03-09T21:00:00");

    let first = t.ingest(&light).await;
    let second = t.ingest(&light).await;

    assert!(matches!(first, IngestOutcome::New(_)));
    assert!(second.is_duplicate());
    assert_eq!(first.frame().hash, second.frame().hash);
    assert_eq!(first.frame().session_id, second.frame().session_id);
    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_ingest_of_same_content_collapses() {
    let t = create_test_archive().await;
    let light = FitsFrame::light("M 42", "Ha", "2024-03-09T21:00:00");

    let outcomes = futures::future::join_all((0..8).map(|_| t.ingest(&light))).await;

    let new = outcomes.iter().filter(|o| !o.is_duplicate()).count();
    assert_eq!(new, 1);
    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), 1);
    assert_eq!(sessions::list_sessions(&t.archive.pool, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_header_fields_are_catalogued() {
    let t = create_test_archive().await;
    let frame = t
        .ingest_frame(
            &FitsFrame::light("NGC 7000", "OIII", "2024-06-01T23:30:00")
                .card("CCD-TEMP", "-10.5")
                .card("GAIN", "120")
                .card("OFFSET", "30")
                .card("OBSERVER", "J. Doe")
                .card("FWHM", "2.31")
                .card("STARS", "1204"),
        )
        .await;

    assert_eq!(frame.frame_type, FrameType::Light);
    assert_eq!(frame.object_name.as_deref(), Some("NGC 7000"));
    assert_eq!(frame.acquisition.telescope.as_deref(), Some("T1"));
    assert_eq!(frame.acquisition.exposure, Some(300.0));
    assert_eq!(frame.acquisition.ccd_temp, Some(-10.5));
    assert_eq!(frame.acquisition.gain, Some(120.0));
    assert_eq!(frame.acquisition.offset, Some(30.0));
    assert_eq!(frame.observer.as_deref(), Some("J. Doe"));
    assert_eq!(frame.quality.avg_fwhm, Some(2.31));
    assert_eq!(frame.quality.star_count, Some(1204));
    assert!(!frame.is_calibrated());

    let looked_up = t.archive.catalog.lookup(&frame.hash).await.unwrap().unwrap();
    assert_eq!(looked_up, frame);
}

#[tokio::test]
async fn test_missing_imagetyp_is_rejected_without_side_effects() {
    let t = create_test_archive().await;
    let result = t
        .try_ingest(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00").without("IMAGETYP"))
        .await;

    assert!(matches!(result, Err(ArchiveError::InvalidInput(_))));
    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), 0);
    assert!(sessions::list_sessions(&t.archive.pool, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mapping_normalizes_keys_before_storage() {
    let t = create_test_archive().await;
    let catalog = &t.archive.catalog;
    catalog
        .add_mapping("TELESCOP", Some("Esprit 100 ED (fw 1.2)"), "T1", false)
        .await
        .unwrap();
    catalog.add_mapping("filter", None, "L", true).await.unwrap();

    let frame = t
        .ingest_frame(
            &FitsFrame::light("M 31", "ignored", "2024-03-09T21:00:00")
                .card("TELESCOP", "Esprit 100 ED (fw 1.2)")
                .without("FILTER"),
        )
        .await;

    assert_eq!(frame.acquisition.telescope.as_deref(), Some("T1"));
    assert_eq!(frame.acquisition.filter.as_deref(), Some("L"));

    let rules = catalog.list_mappings().await.unwrap();
    assert_eq!(rules.len(), 2);
    assert!(rules.iter().any(|r| r.card == "FILTER" && r.is_default));
}

#[tokio::test]
async fn test_exact_mapping_beats_default() {
    let t = create_test_archive().await;
    let catalog = &t.archive.catalog;
    catalog.add_mapping("INSTRUME", Some("ZWO ASI2600MM Pro"), "CAM1", false).await.unwrap();
    let default_id = catalog.add_mapping("INSTRUME", None, "CAM-OTHER", true).await.unwrap();

    let exact = t
        .ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00").card("INSTRUME", "ZWO ASI2600MM Pro"))
        .await;
    let fallback = t
        .ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:05:00").card("INSTRUME", "Unknown cam"))
        .await;
    assert_eq!(exact.acquisition.instrument.as_deref(), Some("CAM1"));
    assert_eq!(fallback.acquisition.instrument.as_deref(), Some("CAM-OTHER"));

    catalog.remove_mapping(default_id).await.unwrap();
    assert!(matches!(
        catalog.remove_mapping(default_id).await,
        Err(ArchiveError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_frames_within_window_share_a_session() {
    let t = create_test_archive().await;
    let base = "2024-03-09T21:00:00";

    let first = t.ingest_frame(&FitsFrame::light("M 31", "L", base)).await;
    let later = t.ingest_frame(&FitsFrame::light("M 31", "L", &minutes_after(base, 180))).await;
    let other_filter = t.ingest_frame(&FitsFrame::light("M 31", "Ha", &minutes_after(base, 190))).await;
    let next_week = t.ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-16T21:00:00")).await;

    assert_eq!(first.session_id, later.session_id);
    assert_ne!(first.session_id, other_filter.session_id);
    assert_ne!(first.session_id, next_week.session_id);

    let session = t.session_of(&later).await;
    assert_eq!(session.date.format("%Y-%m-%dT%H:%M:%S").to_string(), base);
    assert_eq!(
        session.last_frame_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        minutes_after(base, 180)
    );
}

#[tokio::test]
async fn test_frame_in_two_open_windows_joins_newest_session() {
    let t = create_test_archive().await;

    let early = t.ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T12:00:00")).await;
    // 18 hours on: outside the early session's window, so a second session opens
    let late = t.ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-10T06:00:00")).await;
    assert_ne!(early.session_id, late.session_id);

    // 9 hours from both sessions' latest frames
    let bridge = t.ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00")).await;
    assert_eq!(bridge.session_id, late.session_id);

    let early_session = t.session_of(&early).await;
    assert_eq!(
        early_session.last_frame_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "2024-03-09T12:00:00"
    );
    let late_session = t.session_of(&late).await;
    assert_eq!(late_session.date.format("%Y-%m-%dT%H:%M:%S").to_string(), "2024-03-09T21:00:00");
    assert_eq!(
        late_session.last_frame_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "2024-03-10T06:00:00"
    );
}

#[tokio::test]
async fn test_failed_frame_insert_leaves_sessions_untouched() {
    let t = create_test_archive().await;
    let first = t.ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00")).await;

    sqlx::query(
        "CREATE TRIGGER reject_frames BEFORE INSERT ON fitsfile BEGIN SELECT RAISE(ABORT, 'frame store unavailable'); END",
    )
    .execute(&t.archive.pool)
    .await
    .unwrap();
    let mut rx = t.archive.events.subscribe();

    // Would stretch the existing session
    assert!(t.try_ingest(&FitsFrame::light("M 31", "L", "2024-03-09T23:00:00")).await.is_err());
    // Would open a new one
    assert!(t.try_ingest(&FitsFrame::dark(300.0, "2024-03-10T02:00:00")).await.is_err());

    let all = sessions::list_sessions(&t.archive.pool, None).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(Some(all[0].id), first.session_id);
    assert_eq!(
        all[0].last_frame_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "2024-03-09T21:00:00"
    );
    assert_eq!(frames::count_frames(&t.archive.pool).await.unwrap(), 1);
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn test_calibration_frames_ignore_object_name() {
    let t = create_test_archive().await;
    let a = t.ingest_frame(&FitsFrame::dark(300.0, "2024-03-10T02:00:00").card("OBJECT", "M 31")).await;
    let b = t.ingest_frame(&FitsFrame::dark(300.0, "2024-03-10T02:10:00").card("OBJECT", "Darks")).await;
    let flat = t.ingest_frame(&FitsFrame::flat("L", "2024-03-10T02:20:00")).await;

    assert_eq!(a.session_id, b.session_id);
    assert_ne!(a.session_id, flat.session_id);
}

#[tokio::test]
async fn test_session_created_event_emitted_once_per_session() {
    let t = create_test_archive().await;
    let mut rx = t.archive.events.subscribe();

    t.ingest_many(3, |i| FitsFrame::bias(&minutes_after("2024-03-10T03:00:00", i as i64))).await;

    let events = drain_events(&mut rx);
    let created = events
        .iter()
        .filter(|e| matches!(e, ArchiveEvent::SessionCreated { .. }))
        .count();
    let ingested = events
        .iter()
        .filter(|e| matches!(e, ArchiveEvent::FrameIngested { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(ingested, 3);
}

#[tokio::test]
async fn test_query_filters_lazily() {
    let t = create_test_archive().await;
    let lights = t
        .ingest_many(3, |i| FitsFrame::light("M 31", "L", &minutes_after("2024-03-09T21:00:00", i as i64)))
        .await;
    t.ingest_many(2, |i| FitsFrame::dark(300.0, &minutes_after("2024-03-10T02:00:00", i as i64)))
        .await;

    let catalog = &t.archive.catalog;
    let darks: Vec<_> = catalog
        .query(FrameFilter {
            frame_type: Some(FrameType::Dark),
            ..Default::default()
        })
        .try_collect()
        .await
        .unwrap();
    assert_eq!(darks.len(), 2);

    let in_session: Vec<_> = catalog
        .query(FrameFilter {
            session_id: lights[0].session_id,
            ..Default::default()
        })
        .try_collect()
        .await
        .unwrap();
    assert_eq!(in_session.len(), 3);
    let mut hashes: Vec<_> = in_session.iter().map(|f| f.hash.clone()).collect();
    let sorted = {
        let mut h = hashes.clone();
        h.sort();
        h
    };
    assert_eq!(hashes, sorted);
    hashes.dedup();
    assert_eq!(hashes.len(), 3);

    let calibrated: Vec<_> = catalog
        .query(FrameFilter {
            calibrated: Some(true),
            ..Default::default()
        })
        .try_collect()
        .await
        .unwrap();
    assert!(calibrated.is_empty());
}

#[tokio::test]
async fn test_register_calibrated_enforces_references() {
    let t = create_test_archive().await;
    let light = t.ingest_frame(&FitsFrame::light("M 31", "L", "2024-03-09T21:00:00")).await;
    let darks = t
        .ingest_many(3, |i| FitsFrame::dark(300.0, &minutes_after("2024-03-10T02:00:00", i as i64)))
        .await;
    let master = t
        .archive
        .synthesizer
        .synthesize(darks[0].session_id.unwrap())
        .await
        .unwrap();

    let derived_path = t.dir.path().join("calibrated/m31_cal.fits");
    std::fs::create_dir_all(derived_path.parent().unwrap()).unwrap();
    std::fs::write(&derived_path, b"calibrated pixels").unwrap();
    let derived = ContentHash::of_bytes(b"calibrated pixels");
    let catalog = &t.archive.catalog;

    // Dark master referenced as a bias
    let wrong_role = CalibrationRefs {
        bias: Some(master.id),
        ..Default::default()
    };
    assert!(matches!(
        catalog.register_calibrated(&light.hash, &derived, &derived_path, &wrong_role).await,
        Err(ArchiveError::ReferentialIntegrity { .. })
    ));

    let missing_master = CalibrationRefs {
        dark: Some(MasterId::new()),
        ..Default::default()
    };
    assert!(matches!(
        catalog.register_calibrated(&light.hash, &derived, &derived_path, &missing_master).await,
        Err(ArchiveError::ReferentialIntegrity { .. })
    ));

    let refs = CalibrationRefs {
        dark: Some(master.id),
        ..Default::default()
    };
    let unknown_original = ContentHash::of_bytes(b"never ingested");
    assert!(matches!(
        catalog.register_calibrated(&unknown_original, &derived, &derived_path, &refs).await,
        Err(ArchiveError::ReferentialIntegrity { .. })
    ));

    let calibrated = catalog
        .register_calibrated(&light.hash, &derived, &derived_path, &refs)
        .await
        .unwrap();
    assert!(calibrated.is_calibrated());
    assert_eq!(calibrated.calibration.masters.dark, Some(master.id));
    assert_eq!(calibrated.calibration.original_file_ref.as_ref(), Some(&light.hash));
    assert_eq!(calibrated.session_id, light.session_id);
    assert_eq!(calibrated.object_name.as_deref(), Some("M 31"));

    // Registering the same derivative again is idempotent
    let again = catalog
        .register_calibrated(&light.hash, &derived, &derived_path, &refs)
        .await
        .unwrap();
    assert_eq!(again, calibrated);
}

#[tokio::test]
async fn test_variable_star_flags_light_sessions() {
    let t = create_test_archive().await;
    let before = t.ingest_frame(&FitsFrame::light("RR Lyr", "V", "2024-05-01T22:00:00")).await;
    assert!(!t.session_of(&before).await.is_variable_star);

    let catalog = &t.archive.catalog;
    assert!(catalog.touch_variable_star("RR Lyr").await.unwrap());
    assert!(!catalog.touch_variable_star("RR Lyr").await.unwrap());
    assert!(t.session_of(&before).await.is_variable_star);

    let after = t.ingest_frame(&FitsFrame::light("RR Lyr", "V", "2024-05-10T22:00:00")).await;
    assert_ne!(before.session_id, after.session_id);
    assert!(t.session_of(&after).await.is_variable_star);

    let unrelated = t.ingest_frame(&FitsFrame::light("M 13", "V", "2024-05-10T22:00:00")).await;
    assert!(!t.session_of(&unrelated).await.is_variable_star);

    let stars = catalog.list_variable_stars().await.unwrap();
    assert_eq!(stars.len(), 1);
    assert_eq!(stars[0].0, "RR Lyr");
}
