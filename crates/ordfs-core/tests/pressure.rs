#![forbid(unsafe_code)]
//! Backpressure: creators pause at the ceiling until the background
//! cleaner retires something, bounded by the configured pause.

mod common;

use common::{Harness, FS, MOUNT};
use ordfs_core::SoftdepConfig;
use ordfs_types::InodeNum;
use std::time::{Duration, Instant};

#[test]
fn creator_over_the_ceiling_waits_for_the_cleaner() {
    let config = SoftdepConfig {
        max_inode_deps: 4,
        cleanup_pause: Duration::from_millis(500),
        ..SoftdepConfig::default()
    };
    let h = Harness::with_config(config);
    h.engine.start_background();

    for i in 0..4 {
        h.engine.change_link_count(FS, InodeNum(100 + i), 2, 2);
    }
    assert_eq!(h.engine.num_inode_deps(), 4);

    // The fifth creation crosses the ceiling: it must request cleanup and
    // return only after the cleaner retired at least one record (or the
    // bounded pause elapsed — with a live cleaner, well before it).
    let start = Instant::now();
    h.engine.change_link_count(FS, InodeNum(104), 2, 2);
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "creator stalled past the pause bound: {elapsed:?}"
    );
    assert!(
        h.engine.num_inode_deps() <= 4,
        "the cleaner retired nothing: {} records live",
        h.engine.num_inode_deps()
    );

    h.engine.stop_background();
    h.engine.flush_all_for_mount(MOUNT).expect("flush");
    assert_eq!(h.engine.total_live_records(), 0);
}

#[test]
fn pressure_is_latency_not_an_error() {
    // Without a running cleaner the creator still proceeds after the
    // bounded pause — resource pressure never surfaces as a failure.
    let config = SoftdepConfig {
        max_inode_deps: 2,
        cleanup_pause: Duration::from_millis(20),
        ..SoftdepConfig::default()
    };
    let h = Harness::with_config(config);

    for i in 0..2 {
        h.engine.change_link_count(FS, InodeNum(200 + i), 2, 2);
    }
    let start = Instant::now();
    h.engine.change_link_count(FS, InodeNum(202), 2, 2);
    assert!(start.elapsed() >= Duration::from_millis(20), "pause was skipped");
    assert_eq!(h.engine.num_inode_deps(), 3);

    h.engine.flush_all_for_mount(MOUNT).expect("flush");
    assert_eq!(h.engine.total_live_records(), 0);
}
