// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn system_clock_is_nonzero_and_nondecreasing() {
    let clock = SystemClock;
    let t1 = clock.epoch_ms();
    assert!(t1 > 0);
    std::thread::sleep(Duration::from_millis(2));
    assert!(clock.epoch_ms() >= t1);
}

#[test]
fn manual_clock_advances() {
    let clock = ManualClock::new();
    let t1 = clock.epoch_ms();
    clock.advance(Duration::from_secs(60));
    assert_eq!(clock.epoch_ms(), t1 + 60_000);
}

#[test]
fn manual_clock_clones_share_time() {
    let clock1 = ManualClock::new();
    let clock2 = clock1.clone();
    clock2.advance(Duration::from_secs(30));
    assert_eq!(clock1.epoch_ms(), clock2.epoch_ms());
}

#[test]
fn manual_clock_set_epoch_ms() {
    let clock = ManualClock::default();
    clock.set_epoch_ms(42);
    assert_eq!(clock.epoch_ms(), 42);
}
