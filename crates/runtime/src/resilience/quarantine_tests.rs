// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use mc_core::AgentId;

#[test]
fn quarantines_after_consecutive_dead_letters() {
    let quarantine = Quarantine::new(3);
    let agent = AgentId::new("classify").unwrap();
    assert!(!quarantine.record_dlq(&agent));
    assert!(!quarantine.record_dlq(&agent));
    assert!(quarantine.record_dlq(&agent));
    assert!(quarantine.is_active(&agent));
    // Already active: no second activation signal
    assert!(!quarantine.record_dlq(&agent));
}

#[test]
fn success_resets_the_streak() {
    let quarantine = Quarantine::new(3);
    let agent = AgentId::new("classify").unwrap();
    quarantine.record_dlq(&agent);
    quarantine.record_dlq(&agent);
    quarantine.record_ok(&agent);
    assert!(!quarantine.record_dlq(&agent));
    assert!(!quarantine.is_active(&agent));
}

#[test]
fn release_is_manual() {
    let quarantine = Quarantine::new(1);
    let agent = AgentId::new("classify").unwrap();
    assert!(quarantine.record_dlq(&agent));
    assert!(quarantine.is_active(&agent));
    assert!(quarantine.release(&agent));
    assert!(!quarantine.is_active(&agent));
    assert!(!quarantine.release(&agent));
}

#[test]
fn agents_are_tracked_independently() {
    let quarantine = Quarantine::new(1);
    let a = AgentId::new("a").unwrap();
    let b = AgentId::new("b").unwrap();
    quarantine.record_dlq(&a);
    assert!(quarantine.is_active(&a));
    assert!(!quarantine.is_active(&b));
    assert_eq!(quarantine.active_agents(), vec![a]);
}
