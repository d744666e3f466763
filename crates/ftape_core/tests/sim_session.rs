//! End-to-end sessions against the simulated controller and drive.

use proptest::prelude::*;

use ftape_core::{
    buffer::{BufferStatus, RunnerStatus},
    device_types::{
        qic117::{QicStandard, TapeLength},
        sector_map::{SectorMap, SECTOR_SIZE},
    },
    devices::{fdc::FdcHardware, vendors::WakeupMethod},
    sim::{FaultKind, SimConfig, SimulatedFdc, TapeMedia},
    SessionConfig,
    TapeError,
    TapeSession,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn session_config() -> SessionConfig {
    SessionConfig {
        spins_per_us: Some(4),
        ..Default::default()
    }
}

fn formatted(bad: &[(u32, SectorMap)]) -> TapeMedia {
    TapeMedia::formatted(QicStandard::Qic80, TapeLength::Normal, bad).unwrap()
}

fn open(sim: SimConfig, media: TapeMedia) -> TapeSession<SimulatedFdc> {
    let (fdc, events) = SimulatedFdc::new(sim, media);
    TapeSession::open(fdc, events, session_config()).unwrap()
}

fn pattern(segment: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(7).wrapping_add(segment.wrapping_mul(131)) as u8)
        .collect()
}

#[test]
fn test_open_reads_header() {
    init();
    let session = open(SimConfig::default(), formatted(&[]));
    assert_eq!(session.first_data_segment(), 2);
    assert_eq!(session.last_data_segment(), 2799);
    assert_eq!(session.geometry().total_segments(), 2800);
    assert_eq!(session.drive_state().standard, QicStandard::Qic80);
    assert!(!session.is_failed());
}

#[test]
fn test_write_then_read_back() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    let capacity = session.segment_capacity(10);
    assert_eq!(capacity, 29 * SECTOR_SIZE);

    for segment in 10..=15 {
        let taken = session
            .write_segment(segment, &pattern(segment, capacity), segment == 15)
            .unwrap();
        assert_eq!(taken, capacity);
    }
    for segment in 10..=15 {
        assert!(session.hardware().media().is_written(segment));
    }
    for segment in 10..=15 {
        let read = session.read_segment(segment).unwrap();
        assert_eq!(read.data, pattern(segment, capacity), "segment {}", segment);
        assert_eq!(read.file_mark, None);
    }
    assert_eq!(session.history().ecc_failures, 0);
}

#[test]
fn test_crc_error_is_corrected() {
    init();
    let bad = [(12, SectorMap::from_sectors([3, 7]))];
    let mut session = open(SimConfig::default(), formatted(&bad));
    let capacity = session.segment_capacity(12);
    assert_eq!(capacity, 27 * SECTOR_SIZE);

    session.write_segment(12, &pattern(12, capacity), true).unwrap();
    session.hardware_mut().inject_crc(12, 5, 1);
    let corrected = session.history().corrected;

    let read = session.read_segment(12).unwrap();
    assert_eq!(read.data, pattern(12, capacity));
    assert_eq!(session.history().crc_errors, 1);
    assert_eq!(session.history().corrected, corrected + 1);
    assert_eq!(session.hardware().faults().count(), 0);
}

#[test]
fn test_missing_id_is_retried() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    let capacity = session.segment_capacity(30);
    session.write_segment(30, &pattern(30, capacity), true).unwrap();
    // Two sectors unreadable on the first pass: too many for the codec to carry alone.
    session.hardware_mut().inject_fault(30, 8, FaultKind::MissingId, 1);
    session.hardware_mut().inject_fault(30, 20, FaultKind::MissingId, 1);

    let read = session.read_segment(30).unwrap();
    assert_eq!(read.data, pattern(30, capacity));
    assert!(session.history().id_am_errors >= 2);
    assert!(session.history().sector_retries >= 1);
}

#[test]
fn test_empty_segment_is_passed_over() {
    init();
    let bad = [(20, SectorMap::EMPTY_SEGMENT)];
    let mut session = open(SimConfig::default(), formatted(&bad));
    assert_eq!(session.segment_capacity(20), 0);

    session.set_position(19).unwrap();
    let capacity = session.segment_capacity(19);
    assert_eq!(session.write_next(&pattern(19, capacity)).unwrap(), capacity);
    assert_eq!(session.write_next(&pattern(21, capacity)).unwrap(), capacity);
    assert_eq!(session.position(), 22);
    session.flush_buffers().unwrap();
    assert!(!session.hardware().media().is_written(20));

    assert!(session.read_segment(20).unwrap().data.is_empty());
    session.set_position(19).unwrap();
    assert_eq!(session.read_next().unwrap(), pattern(19, capacity));
    assert_eq!(session.read_next().unwrap(), pattern(21, capacity));
}

#[test]
fn test_file_marks_survive_reopen() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    session.set_position(20).unwrap();
    session.write_file_marks(2).unwrap();
    assert_eq!(session.position(), 22);
    session.close().unwrap();

    let (fdc, _events) = session.into_parts();
    let mut session = open(SimConfig::default(), fdc.into_media());
    assert_eq!(session.file_marks().len(), 2);

    session.seek_to_bot().unwrap();
    assert_eq!(session.position(), 2);
    session.seek_to_file_mark(1).unwrap();
    assert_eq!(session.position(), 21);
    session.seek_to_eot().unwrap();
    assert_eq!(session.position(), 22);
    assert!(matches!(session.seek_to_file_mark(-3), Err(TapeError::BeginningOfTape)));

    session.close().unwrap();
    assert!(matches!(session.read_segment(20), Err(TapeError::Failed)));
}

#[test]
fn test_bad_sector_edits_survive_reopen() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    session.bad_sector_map().put_bad_sector_entry(40, SectorMap::from_sectors([4, 9]));
    session.close().unwrap();

    let (fdc, _events) = session.into_parts();
    let mut session = open(SimConfig::default(), fdc.into_media());
    assert_eq!(session.bad_sectors(40), SectorMap::from_sectors([4, 9]));
    assert_eq!(session.segment_capacity(40), 27 * SECTOR_SIZE);
}

#[test]
fn test_dead_segment_latches_the_session() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    let capacity = session.segment_capacity(50);
    session.write_segment(50, &pattern(50, capacity), true).unwrap();
    for sector in [2, 9, 17, 25] {
        session.hardware_mut().inject_crc(50, sector, 1000);
    }

    let err = session.read_segment(50).unwrap_err();
    assert!(
        matches!(err, TapeError::MediaDefect(50) | TapeError::EccFailure(50)),
        "{:?}",
        err
    );
    assert!(err.is_fatal());
    assert!(session.is_failed());
    assert!(matches!(session.read_segment(10), Err(TapeError::Failed)));
}

#[test]
fn test_slow_result_byte_is_waited_for() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    let capacity = session.segment_capacity(10);
    session.write_segment(10, &pattern(10, capacity), true).unwrap();

    // Longer than one byte timeout, shorter than the retries together.
    session.hardware_mut().stall_result(2500);
    let read = session.read_segment(10).unwrap();
    assert_eq!(read.data, pattern(10, capacity));
    assert!(!session.is_failed());
}

#[test]
fn test_cancel_stops_the_tape_and_recovers() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    let capacity = session.segment_capacity(10);
    session.write_segment(10, &pattern(10, capacity), true).unwrap();
    session.write_segment(1500, &pattern(1500, capacity), true).unwrap();
    session.read_segment(10).unwrap();

    // The long seek to 1500 is the first wait to see the cancel.
    let token = session.cancel_token();
    token.cancel();
    assert!(matches!(session.read_segment(1500), Err(TapeError::Cancelled)));
    assert_eq!(session.runner_status(), RunnerStatus::Idle);
    assert!(!session.drive_state().tape_running);
    let now = session.hardware().now_us();
    assert!(!session.hardware().drive().is_streaming(now));
    assert!(!session.is_failed());

    // Still cancelled until the token is reset.
    assert!(matches!(session.read_segment(1500), Err(TapeError::Cancelled)));
    token.reset();
    assert_eq!(session.read_segment(1500).unwrap().data, pattern(1500, capacity));
}

#[test]
fn test_skip_overshoot_is_learned() {
    init();
    let sim = SimConfig {
        skip_bias: 3,
        ..Default::default()
    };
    let mut session = open(sim, formatted(&[]));
    for segment in [20, 40, 60, 80] {
        let read = session.read_segment(segment).unwrap();
        assert_eq!(read.data.len(), 29 * SECTOR_SIZE);
    }
    assert!(session.positioning().overshoot > 1);
    assert!(session.history().fast_skips >= 1);
}

#[test]
fn test_segments_on_an_odd_track() {
    init();
    let mut session = open(SimConfig::default(), formatted(&[]));
    // Track 1 runs from the far end of the tape back towards the load point.
    let segment = session.geometry().track_start(1) + 5;
    let capacity = session.segment_capacity(segment);
    session.write_segment(segment, &pattern(segment, capacity), true).unwrap();
    assert_eq!(session.read_segment(segment).unwrap().data, pattern(segment, capacity));
    assert_eq!(session.drive_state().track, Some(1));
}

#[test]
fn test_write_protected_cartridge() {
    init();
    let sim = SimConfig {
        write_protected: true,
        ..Default::default()
    };
    let mut session = open(sim, formatted(&[]));
    assert!(session.drive_state().write_protected);
    assert!(matches!(
        session.write_segment(10, &[0u8; SECTOR_SIZE], true),
        Err(TapeError::WriteProtected)
    ));
}

#[test]
fn test_wakeup_methods_are_probed() {
    init();
    for method in [WakeupMethod::Colorado, WakeupMethod::Mountain, WakeupMethod::Insight] {
        let sim = SimConfig {
            wakeup: method,
            ..Default::default()
        };
        let session = open(sim, formatted(&[]));
        assert_eq!(session.drive_state().wakeup, method);
    }
}

#[test]
fn test_positioning_converges_with_noisy_skips() {
    init();
    let sim = SimConfig {
        skip_bias: 2,
        reverse_bias: 3,
        skip_noise: 2,
        seed: 11,
        ..Default::default()
    };
    let mut session = open(sim, formatted(&[]));
    for segment in [60, 15, 85, 40, 95, 5] {
        let read = session.read_segment(segment).unwrap();
        assert_eq!(read.data.len(), 29 * SECTOR_SIZE, "segment {}", segment);
    }
    assert!(!session.is_failed());
    assert!(session.history().fast_skips >= 2);
}

#[derive(Clone, Debug)]
enum RingOp {
    Read(u32),
    Write(u32, bool),
    Flush,
}

fn ring_op() -> impl Strategy<Value = RingOp> {
    prop_oneof![
        (2u32..60).prop_map(RingOp::Read),
        (2u32..60, any::<bool>()).prop_map(|(segment, flush)| RingOp::Write(segment, flush)),
        Just(RingOp::Flush),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Whenever control is back in the foreground, a slot still claimed by the interrupt
    /// side implies the runner is still going.
    #[test]
    fn prop_ring_slots_are_never_shared(ops in proptest::collection::vec(ring_op(), 1..8)) {
        let mut session = open(SimConfig::default(), formatted(&[]));
        for op in &ops {
            let result = match *op {
                RingOp::Read(segment) => session.read_segment(segment).map(|_| ()),
                RingOp::Write(segment, flush) => {
                    let capacity = session.segment_capacity(segment);
                    session.write_segment(segment, &pattern(segment, capacity), flush).map(|_| ())
                }
                RingOp::Flush => session.flush_buffers(),
            };
            let statuses = session.buffer_statuses();
            let claimed = statuses.iter().any(|s| matches!(s, BufferStatus::Reading | BufferStatus::Writing));
            prop_assert!(
                !claimed || session.runner_status().is_active(),
                "{:?} ({:?}) left {:?} with runner {}",
                op,
                result,
                statuses,
                session.runner_status()
            );
        }
    }
}
