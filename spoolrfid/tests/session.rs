//! End-to-end sessions against the simulated reader

use std::time::Duration;

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use spoolrfid::{
    AcquirePolicy, Error, FailReason, FieldSet, KeyDerivation, LinkConfig, Reader, Rgba,
    SessionState, SpoolFields, SpoolRecord, TagUid,
};
use spoolrfid_core::CommandId;
use spoolrfid_core::tag::layout::{self, KEY_B_RANGE, SPOOL_SECTORS, TRAILER_BLOCK};
use spoolrfid_transport::{SimulatedReader, SimulatedTag};
use spoolrfid_types::BlockAddress;

const UID: TagUid = TagUid::new([0x75, 0x88, 0x6B, 0x1D]);
const OTHER_UID: TagUid = TagUid::new([0x04, 0xA2, 0x19, 0xC3]);

fn fields() -> SpoolFields {
    SpoolFields {
        variant_id: Some("A00-K0".into()),
        material_id: Some("GFA00".into()),
        material_type: Some("PLA".into()),
        material_name: Some("PLA Basic".into()),
        color: Some(Rgba::new(0x16, 0x16, 0x16, 0xFF)),
        spool_weight_g: Some(1000),
        filament_diameter_mm: Some(1.75),
        bed_temp_c: Some(55),
        nozzle_temp_min_c: Some(190),
        nozzle_temp_max_c: Some(230),
        nozzle_diameter_mm: Some(0.4),
        lot: Some("B2311030A1".into()),
        remaining_weight_g: Some(812.5),
        remaining_length_m: Some(271.3),
        produced_at: NaiveDate::from_ymd_opt(2023, 11, 3).and_then(|d| d.and_hms_opt(9, 15, 0)),
        manufacturer_checksum: None,
    }
    .seal()
}

fn record(uid: TagUid) -> SpoolRecord {
    SpoolRecord::new(uid, fields())
}

fn spool_tag() -> SimulatedTag {
    SimulatedTag::from_record(&record(UID), &KeyDerivation::default()).unwrap()
}

fn reader(sim: &SimulatedReader) -> Reader<SimulatedReader> {
    let config = LinkConfig::default()
        .with_timeout(Duration::from_millis(100))
        .with_retries(3);
    Reader::with_link_config(sim.clone(), config)
}

#[tokio::test]
async fn test_read_spool() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    let read = session.read_spool().await.unwrap();
    assert_eq!(read, record(UID));
    assert!(read.is_complete());
    assert_eq!(read.manufacturer_checksum_valid(), Some(true));
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.record(), Some(&read));
    assert!(session.last_image().is_some_and(|image| image.is_complete()));

    assert_eq!(sim.count(CommandId::Detect), 1);
    assert_eq!(sim.count(CommandId::Auth), 4);
    assert_eq!(sim.count(CommandId::Read), 16);

    session.end().await.unwrap();
    assert_eq!(sim.count(CommandId::Halt), 1);
}

#[tokio::test]
async fn test_read_twice_same_record() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let first = session.read_spool().await.unwrap();
    let second = session.read_spool().await.unwrap();
    assert_eq!(first, second);
    session.end().await.unwrap();

    let mut session = reader.start_session().await.unwrap();
    assert_eq!(session.read_spool().await.unwrap(), first);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_second_session_is_rejected() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);
    let other = reader.clone();

    let session = reader.start_session().await.unwrap();
    assert!(matches!(other.start_session().await, Err(Error::DeviceBusy)));

    session.end().await.unwrap();
    let session = other.start_session().await.unwrap();
    session.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_waiting_session_starts_after_end() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);
    let waiting = reader
        .clone()
        .with_acquire_policy(AcquirePolicy::Wait(Duration::from_secs(5)));

    let session = reader.start_session().await.unwrap();
    let pending = tokio::spawn(async move {
        let mut session = waiting.start_session().await?;
        let record = session.read_spool().await?;
        session.end().await?;
        Ok::<_, Error>(record)
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    session.end().await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap(), record(UID));
}

#[tokio::test(start_paused = true)]
async fn test_silent_reader_fails_within_bound() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);
    let mut session = reader.start_session().await.unwrap();
    sim.set_silent(true);

    let start = tokio::time::Instant::now();
    let result = session.read_spool().await;

    assert!(matches!(
        result,
        Err(Error::Transport(spoolrfid_transport::Error::LinkTimeout { .. }))
    ));
    assert_eq!(start.elapsed(), Duration::from_millis(300));
    assert_eq!(session.state(), SessionState::Failed(FailReason::LinkTimeout));
    assert!(session.record().is_none());

    // Silent reader gets no HALT
    session.end().await.unwrap();
    assert_eq!(sim.count(CommandId::Halt), 0);
}

#[tokio::test]
async fn test_bad_sector_checksum_invalidates_its_fields_only() {
    let mut tag = spool_tag();
    tag.corrupt_checksum(2);
    let sim = SimulatedReader::with_tag(tag);
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let read = session.read_spool().await.unwrap();

    assert_eq!(
        read.invalid_fields(),
        FieldSet::NOZZLE_DIAMETER
            | FieldSet::LOT
            | FieldSet::REMAINING_WEIGHT
            | FieldSet::REMAINING_LENGTH
    );
    assert_eq!(read.material_type(), Some("PLA"));
    assert_eq!(read.lot(), None);
    assert_eq!(session.state(), SessionState::Ready);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_refused_sector_invalidates_its_fields_only() {
    let sim = SimulatedReader::with_tag(spool_tag());
    sim.refuse_auth(1);
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let read = session.read_spool().await.unwrap();

    assert_eq!(read.fields().material_name, None);
    assert!(read.color().is_none());
    assert!(!read.invalid_fields().contains(FieldSet::LOT));
    assert_eq!(read.lot(), Some("B2311030A1"));
    assert_eq!(sim.count(CommandId::Read), 12);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_foreign_keyed_tag_fails_auth() {
    let foreign = KeyDerivation::new([0x11; 16]);
    let sim = SimulatedReader::with_tag(SimulatedTag::keyed(UID, &foreign).unwrap());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    assert!(matches!(
        session.read_spool().await,
        Err(Error::Failed(FailReason::AuthFailed))
    ));
    assert_eq!(session.state(), SessionState::Failed(FailReason::AuthFailed));
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_no_tag() {
    let sim = SimulatedReader::new();
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    assert!(matches!(session.read_spool().await, Err(Error::NoTag)));
    assert_eq!(session.state(), SessionState::Failed(FailReason::NoTag));

    // A failed session keeps failing with its reason
    assert!(matches!(
        session.read_spool().await,
        Err(Error::Failed(FailReason::NoTag))
    ));
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_tag_removed_mid_read() {
    let sim = SimulatedReader::with_tag(spool_tag());
    // Detect, Auth, Read S0B0 are answered; the tag leaves before S0B1
    sim.remove_tag_after(3);
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    assert!(matches!(session.read_spool().await, Err(Error::TagRemoved)));
    assert_eq!(session.state(), SessionState::Failed(FailReason::TagRemoved));
    assert!(session.record().is_none());
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_response_fails_session() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    sim.corrupt_next_response();

    assert!(matches!(
        session.read_spool().await,
        Err(Error::Core(spoolrfid_core::Error::ChecksumMismatch { .. }))
    ));
    assert!(matches!(
        session.state(),
        SessionState::Failed(FailReason::Protocol(_))
    ));
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_write_and_verify() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let read = session.read_spool().await.unwrap();

    let mut updated = read.into_fields();
    updated.remaining_weight_g = Some(640.0);
    updated.remaining_length_m = Some(213.9);
    let updated = SpoolRecord::new(UID, updated);

    let written = session.write_spool(&updated).await.unwrap();
    assert_eq!(written, updated);
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.record(), Some(&updated));

    // Trailers were rewritten with the derived keys, so a fresh session reads it
    session.end().await.unwrap();
    let mut session = reader.start_session().await.unwrap();
    assert_eq!(session.read_spool().await.unwrap(), updated);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_write_rejects_out_of_range_before_sending() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();
    sim.clear_commands();

    let mut bad = fields();
    bad.filament_diameter_mm = Some(1.755);
    let err = session
        .write_spool(&SpoolRecord::new(UID, bad))
        .await
        .unwrap_err();

    assert!(err.is_encoding_error());
    assert!(sim.commands().is_empty());
    assert_eq!(session.state(), SessionState::Ready);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_write_requires_ready() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    assert!(matches!(
        session.write_spool(&record(UID)).await,
        Err(Error::InvalidSessionState(_))
    ));
    assert_eq!(session.state(), SessionState::Idle);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_write_protected_sector() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();
    sim.write_protect(2);

    let result = session.write_spool(&record(UID)).await;
    assert!(matches!(
        result,
        Err(Error::WriteProtected { sector: 2, block: 0 })
    ));
    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::WriteProtected)
    );
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_write_to_swapped_tag_is_refused() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();
    sim.present(SimulatedTag::keyed(OTHER_UID, &KeyDerivation::default()).unwrap());

    assert!(matches!(
        session.write_spool(&record(UID)).await,
        Err(Error::TagRemoved)
    ));
    assert_eq!(sim.count(CommandId::Write), 0);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_clone_onto_another_tag() {
    let source = SimulatedReader::with_tag(spool_tag());
    let mut session = reader(&source).start_session().await.unwrap();
    let original = session.read_spool().await.unwrap();
    session.end().await.unwrap();

    let target = SimulatedTag::keyed(OTHER_UID, &KeyDerivation::default()).unwrap();
    let sim = SimulatedReader::with_tag(target);
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let blank = session.read_spool().await.unwrap();
    assert_eq!(blank.uid(), OTHER_UID);
    assert!(!blank.is_complete());

    let cloned = session.write_spool(&original).await.unwrap();
    assert_eq!(cloned.uid(), OTHER_UID);
    assert_eq!(cloned.fields(), original.fields());
    session.end().await.unwrap();

    // The manufacturer block still carries the target's own UID
    let tag = sim.tag().unwrap();
    assert_eq!(
        tag.block(BlockAddress::new(0, 0).unwrap()),
        layout::manufacturer_block(&OTHER_UID)
    );
}

#[tokio::test]
async fn test_cancel_stops_after_current_read() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let handle = session.handle();
    handle.cancel();

    assert!(matches!(session.read_spool().await, Err(Error::Cancelled)));
    assert_eq!(sim.count(CommandId::Read), 1);
    assert_eq!(handle.state(), SessionState::Failed(FailReason::Cancelled));

    // Halt still goes out after a cancel
    session.end().await.unwrap();
    assert_eq!(sim.count(CommandId::Halt), 1);
}

#[tokio::test]
async fn test_disconnect_fails_session() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();
    sim.disconnect();

    assert!(matches!(
        session.read_spool().await,
        Err(Error::Transport(spoolrfid_transport::Error::LinkDisconnected))
    ));
    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::LinkDisconnected)
    );
    assert!(matches!(
        session.write_spool(&record(UID)).await,
        Err(Error::Failed(FailReason::LinkDisconnected))
    ));
    session.end().await.unwrap();
    assert!(!reader.is_busy());
}

#[tokio::test]
async fn test_firmware_version() {
    let sim = SimulatedReader::new();
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let firmware = session.firmware_version().await.unwrap();
    assert_eq!(firmware.version, 1);
    assert_eq!(firmware.revision, 6);
    assert_eq!(session.state(), SessionState::Idle);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_dropped_session_releases_reader() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    {
        let mut session = reader.start_session().await.unwrap();
        session.read_spool().await.unwrap();
    }
    assert!(!reader.is_busy());
    assert_eq!(sim.count(CommandId::Halt), 0);
}

#[tokio::test]
async fn test_read_blank_tag() {
    let sim = SimulatedReader::with_tag(SimulatedTag::blank(UID));
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let read = session.read_spool().await.unwrap();

    assert_eq!(read.uid(), UID);
    assert_eq!(read.invalid_fields(), FieldSet::all());
    assert_eq!(session.state(), SessionState::Ready);
    // Each sector refuses the derived key, is selected again and opens with
    // the transport key; blank sectors are not read
    assert_eq!(sim.count(CommandId::Auth), 8);
    assert_eq!(sim.count(CommandId::Detect), 5);
    assert_eq!(sim.count(CommandId::Read), 0);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_write_provisions_blank_tag() {
    let sim = SimulatedReader::with_tag(SimulatedTag::blank(UID));
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();
    let written = session.write_spool(&record(UID)).await.unwrap();
    assert_eq!(written, record(UID));
    session.end().await.unwrap();

    let keys = KeyDerivation::default().derive(&UID).unwrap();
    let tag = sim.tag().unwrap();
    for sector in SPOOL_SECTORS {
        let trailer = tag.block(BlockAddress::new(sector, TRAILER_BLOCK).unwrap());
        assert_eq!(&trailer.as_bytes()[KEY_B_RANGE], keys.key_b(sector).unwrap().as_bytes());
    }

    // Now keyed for the tag, so a fresh session opens it with one auth per sector
    sim.clear_commands();
    let mut session = reader.start_session().await.unwrap();
    assert_eq!(session.read_spool().await.unwrap(), record(UID));
    assert_eq!(sim.count(CommandId::Auth), 4);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_erase_restores_blank_sectors() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();

    let erased = session.erase_spool().await.unwrap();
    assert_eq!(erased.uid(), UID);
    assert_eq!(erased.invalid_fields(), FieldSet::all());
    assert_eq!(session.state(), SessionState::Ready);

    let blank = SimulatedTag::blank(UID);
    let tag = sim.tag().unwrap();
    for sector in SPOOL_SECTORS {
        for block in 0..4 {
            let address = BlockAddress::new(sector, block).unwrap();
            assert_eq!(tag.block(address), blank.block(address), "S{}B{}", sector, block);
        }
    }

    // The erased tag takes a new record straight away
    assert_eq!(session.write_spool(&record(UID)).await.unwrap(), record(UID));
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_erase_requires_ready() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    assert!(matches!(
        session.erase_spool().await,
        Err(Error::InvalidSessionState(_))
    ));
    assert_eq!(sim.count(CommandId::Write), 0);
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_erase_write_protected_sector() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    session.read_spool().await.unwrap();
    sim.write_protect(1);

    assert!(matches!(
        session.erase_spool().await,
        Err(Error::WriteProtected { sector: 1, block: 0 })
    ));
    assert_eq!(
        session.state(),
        SessionState::Failed(FailReason::WriteProtected)
    );
    session.end().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_write_finishes_sector() {
    let sim = SimulatedReader::with_tag(spool_tag());
    let reader = reader(&sim);

    let mut session = reader.start_session().await.unwrap();
    let read = session.read_spool().await.unwrap();
    session.handle().cancel();

    let mut updated = read.into_fields();
    updated.remaining_weight_g = Some(500.0);
    assert!(matches!(
        session.write_spool(&SpoolRecord::new(UID, updated)).await,
        Err(Error::Cancelled)
    ));

    // Sector 0 got both data blocks and its trailer, nothing else was touched
    assert_eq!(sim.count(CommandId::Write), 3);
    let image = sim.tag().unwrap().image();
    let sector = image.sector(0).unwrap();
    assert_eq!(
        layout::stored_checksum(&sector[TRAILER_BLOCK as usize]),
        layout::sector_checksum(0, sector)
    );
    assert_eq!(sim.tag().unwrap().image(), spool_tag().image());
    session.end().await.unwrap();
}
