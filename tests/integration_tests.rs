//! SpareMap Integration Tests
//!
//! End-to-end scenarios through the public API:
//! - Manual remap lifecycle and spare-area exhaustion
//! - I/O redirection through the mapping path
//! - Health decay and failure prediction
//! - Scanner lifecycle and proactive remapping

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use sparemap::{
    DeviceRole, Error, IoRequest, ManualClock, MemTransport, RemapTarget, RiskLevel,
    ScannerState, SectorScanner, TargetConfig,
};

const MAIN_SECTORS: u64 = 4096;

fn config(spare_start: u64, spare_len: u64) -> TargetConfig {
    TargetConfig {
        main_sectors: MAIN_SECTORS,
        spare_start,
        spare_len,
        scan_interval: Duration::from_millis(100),
        sectors_per_scan: 1024,
        ..Default::default()
    }
}

fn build(
    spare_start: u64,
    spare_len: u64,
) -> (Arc<MemTransport>, Arc<ManualClock>, Arc<RemapTarget>) {
    let transport = Arc::new(MemTransport::new(MAIN_SECTORS, spare_start + spare_len));
    let clock = Arc::new(ManualClock::new());
    let target =
        RemapTarget::new(config(spare_start, spare_len), transport.clone(), clock.clone())
            .expect("target construction");
    (transport, clock, target)
}

// =============================================================================
// Remap lifecycle scenarios
// =============================================================================

mod remap_tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_remap_scenario() {
        // Spare area [1000, 1100).
        let (_, _, target) = build(1000, 100);

        assert_eq!(target.add_manual_remap(500).unwrap(), 1000);
        assert_matches!(
            target.add_manual_remap(500),
            Err(Error::AlreadyMapped { sector: 500 })
        );
        assert_eq!(target.query_remap(500), Some(1000));
        assert_eq!(target.query_remap(999), None);
        target.stop().await;
    }

    #[tokio::test]
    async fn test_exhaustion_scenario() {
        let (_, _, target) = build(1000, 2);

        target.add_manual_remap(10).unwrap();
        target.add_manual_remap(20).unwrap();
        assert_matches!(target.add_manual_remap(30), Err(Error::NoSpareCapacity));

        let stats = target.get_statistics();
        assert_eq!(stats.spare_used, 2);
        assert_eq!(stats.remapped_count, 2);
        target.stop().await;
    }

    #[tokio::test]
    async fn test_clear_then_reuse() {
        let (_, _, target) = build(1000, 3);
        for sector in [5, 6, 7] {
            target.add_manual_remap(sector).unwrap();
        }
        target.clear_all_remaps();
        for sector in [5, 6, 7] {
            assert_eq!(target.query_remap(sector), None);
        }
        // Full capacity is available again after the clear.
        for sector in [50, 60, 70] {
            target.add_manual_remap(sector).unwrap();
        }
        target.stop().await;
    }

    #[tokio::test]
    async fn test_remapped_write_read_roundtrip() {
        let (transport, _, target) = build(1000, 8);
        target.add_manual_remap(77).unwrap();

        let payload = vec![0x5A; sparemap::SECTOR_SIZE];
        target
            .submit_io(IoRequest::write(77, payload.clone().into()))
            .await
            .unwrap();
        let got = target.submit_io(IoRequest::read(77)).await.unwrap();
        assert_eq!(&got[..], &payload[..]);

        // Both operations landed on the spare device.
        assert_eq!(transport.writes(DeviceRole::Spare), 1);
        assert!(transport.reads(DeviceRole::Spare) >= 1);
        assert_eq!(transport.writes(DeviceRole::Main), 0);
        target.stop().await;
    }

    #[tokio::test]
    async fn test_passthrough_default() {
        let (transport, _, target) = build(1000, 8);
        for sector in [0, 1, 100, MAIN_SECTORS - 1] {
            target.submit_io(IoRequest::read(sector)).await.unwrap();
        }
        assert_eq!(transport.reads(DeviceRole::Main), 4);
        assert_eq!(transport.reads(DeviceRole::Spare), 0);
        target.stop().await;
    }
}

// =============================================================================
// Health and prediction scenarios
// =============================================================================

mod health_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_decay_scenario() {
        let (transport, _, target) = build(1000, 8);
        target.set_auto_remap_enabled(false);

        // 100 clean accesses: full score with the frequent-access bonus.
        // Recorded through the tracker because clean passthrough reads
        // take the fast path and skip per-sector bookkeeping.
        for _ in 0..101 {
            target.tracker().record_io(42, sparemap::IoKind::Read, true);
        }
        let healthy = target.tracker().get(42).unwrap();
        assert_eq!(healthy.score, 1000);
        assert_eq!(healthy.risk, RiskLevel::Safe);

        // Errors accumulate; the score strictly decreases and the risk
        // level degrades past Safe.
        transport.inject_fault(DeviceRole::Main, 42);
        let mut last_score = healthy.score;
        for _ in 0..44 {
            let _ = target.submit_io(IoRequest::read(42)).await;
            let h = target.tracker().get(42).unwrap();
            assert!(h.score < last_score);
            last_score = h.score;
        }
        // 44 errors over 145 accesses puts the score below the warning
        // threshold.
        let degraded = target.tracker().get(42).unwrap();
        assert!(degraded.score < 700);
        assert!(degraded.risk > RiskLevel::Safe);
        target.stop().await;
    }

    #[tokio::test]
    async fn test_prediction_no_data() {
        let (_, _, target) = build(1000, 8);
        assert_matches!(
            target.predict(123),
            Err(Error::NoHealthData { sector: 123 })
        );
        target.stop().await;
    }

    #[tokio::test]
    async fn test_prediction_after_errors() {
        let (transport, clock, target) = build(1000, 8);
        target.set_auto_remap_enabled(false);
        transport.inject_fault(DeviceRole::Main, 9);
        for _ in 0..20 {
            let _ = target.submit_io(IoRequest::read(9)).await;
        }
        // Age the observation window past a week so reliability is not
        // halved for a freshly-seen sector.
        clock.advance(7 * 86_400);

        let prediction = target.predict(9).unwrap();
        assert!(prediction.failure_probability >= 50);
        assert!(prediction.severity >= 7);
        assert!(!prediction.reason.is_empty());
        target.stop().await;
    }

    #[tokio::test]
    async fn test_auto_remap_end_to_end() {
        let (transport, _, target) = build(1000, 8);
        transport.inject_fault(DeviceRole::Main, 300);

        // Cross the default error threshold of 3.
        for _ in 0..3 {
            let _ = target.submit_io(IoRequest::read(300)).await;
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if target.query_remap(300).is_some() {
                break;
            }
        }
        assert_eq!(target.query_remap(300), Some(1000));
        assert_eq!(target.get_statistics().auto_remaps, 1);

        // Redirected I/O succeeds even though the main sector still faults.
        target.submit_io(IoRequest::read(300)).await.unwrap();
        target.stop().await;
    }

    #[tokio::test]
    async fn test_health_report_mentions_risk() {
        let (transport, _, target) = build(1000, 8);
        target.set_auto_remap_enabled(false);
        transport.inject_fault(DeviceRole::Main, 11);
        for _ in 0..5 {
            let _ = target.submit_io(IoRequest::read(11)).await;
        }
        let report = target.generate_health_report();
        assert!(report.contains("high-risk"));
        assert!(report.contains("back up"));
        target.stop().await;
    }
}

// =============================================================================
// Scanner scenarios
// =============================================================================

mod scanner_tests {
    use super::*;

    fn build_scanner(
        transport: &Arc<MemTransport>,
        clock: &Arc<ManualClock>,
        target: &Arc<RemapTarget>,
    ) -> Arc<SectorScanner> {
        Arc::new(SectorScanner::new(
            target.clone(),
            transport.clone(),
            clock.clone(),
        ))
    }

    /// Fire one interval tick and let the resulting cycle run through
    /// all of its cooperative yield points (1024 sectors per cycle
    /// yield every 64).
    async fn tick_and_settle() {
        tokio::time::advance(Duration::from_millis(100)).await;
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_scanner_lifecycle_scenario() {
        let (transport, clock, target) = build(1000, 8);
        let scanner = build_scanner(&transport, &clock, &target);

        assert_eq!(scanner.state(), ScannerState::Stopped);
        assert_matches!(scanner.pause(), Err(Error::ScannerState { .. }));

        scanner.start().unwrap();
        assert_eq!(scanner.state(), ScannerState::Running);

        scanner.pause().unwrap();
        scanner.resume().unwrap();

        scanner.stop().await.unwrap();
        assert_eq!(scanner.state(), ScannerState::Stopped);
        scanner.stop().await.unwrap();
        target.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_remaps_latent_bad_sector() {
        let (transport, clock, target) = build(1000, 8);
        // The application never touches this sector; only the scanner can
        // find it.
        transport.inject_fault(DeviceRole::Main, 2048);

        let scanner = build_scanner(&transport, &clock, &target);
        scanner.start().unwrap();

        // 4096 sectors at 1024 per cycle: three passes in twelve cycles.
        for _ in 0..13 {
            tick_and_settle().await;
        }
        scanner.stop().await.unwrap();

        assert_eq!(target.query_remap(2048), Some(1000));
        let progress = scanner.progress();
        assert!(progress.full_scans >= 3);
        assert!(progress.errors_found >= 3);
        target.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_coverage_feeds_trend() {
        let (transport, clock, target) = build(1000, 8);
        let scanner = build_scanner(&transport, &clock, &target);

        assert!(target.trend_monitor().low_coverage);

        scanner.start().unwrap();
        // Coverage climbs 25/50/75/100 as the four cycles of a pass land;
        // capture the peak since the cursor wraps back afterwards.
        let mut peak = 0;
        for _ in 0..5 {
            tick_and_settle().await;
            peak = peak.max(target.trend_monitor().coverage_percent);
        }
        scanner.stop().await.unwrap();

        assert_eq!(peak, 100);
        target.stop().await;
    }
}
