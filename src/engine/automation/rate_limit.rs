// Lorekeep Runtime — Automation Rate Limiter
//
// Three sliding windows, checked in order: per-automation (1/min), then
// per-domain (10/h), then global (30/h). Entries are pruned before each
// comparison; a grant appends the timestamp to all three lists. Everything
// is in memory and seeded empty on engine start — stop clears it.

use crate::atoms::constants::{
    RATE_GLOBAL_MAX, RATE_GLOBAL_WINDOW_SECS, RATE_PER_AUTOMATION_MAX,
    RATE_PER_AUTOMATION_WINDOW_SECS, RATE_PER_DOMAIN_MAX, RATE_PER_DOMAIN_WINDOW_SECS,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Windows {
    per_automation: HashMap<String, Vec<DateTime<Utc>>>,
    per_domain: HashMap<String, Vec<DateTime<Utc>>>,
    global: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Granted,
    DeniedAutomation,
    DeniedDomain,
    DeniedGlobal,
}

impl RateDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, RateDecision::Granted)
    }
}

#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check all three windows in order and record the grant.
    pub fn check(&self, automation_id: &str, domain_id: &str, now: DateTime<Utc>) -> RateDecision {
        let mut w = self.windows.lock();

        let auto = w.per_automation.entry(automation_id.to_string()).or_default();
        prune(auto, now, RATE_PER_AUTOMATION_WINDOW_SECS);
        if auto.len() >= RATE_PER_AUTOMATION_MAX {
            return RateDecision::DeniedAutomation;
        }

        let domain = w.per_domain.entry(domain_id.to_string()).or_default();
        prune(domain, now, RATE_PER_DOMAIN_WINDOW_SECS);
        if domain.len() >= RATE_PER_DOMAIN_MAX {
            return RateDecision::DeniedDomain;
        }

        prune(&mut w.global, now, RATE_GLOBAL_WINDOW_SECS);
        if w.global.len() >= RATE_GLOBAL_MAX {
            return RateDecision::DeniedGlobal;
        }

        // Granted: append to all three lists.
        w.per_automation.get_mut(automation_id).expect("entry").push(now);
        w.per_domain.get_mut(domain_id).expect("entry").push(now);
        w.global.push(now);
        RateDecision::Granted
    }

    /// Engine stop: drop all counters.
    pub fn clear(&self) {
        let mut w = self.windows.lock();
        w.per_automation.clear();
        w.per_domain.clear();
        w.global.clear();
    }
}

fn prune(entries: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>, window_secs: i64) {
    let cutoff = now - Duration::seconds(window_secs);
    entries.retain(|t| *t > cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 10, 0, 0).unwrap()
    }

    #[test]
    fn one_grant_per_automation_per_minute() {
        let rl = RateLimiter::new();
        let now = t0();
        assert_eq!(rl.check("a1", "d1", now), RateDecision::Granted);
        assert_eq!(rl.check("a1", "d1", now), RateDecision::DeniedAutomation);
        assert_eq!(
            rl.check("a1", "d1", now + Duration::seconds(59)),
            RateDecision::DeniedAutomation
        );
        // Window slides: 61s later the old entry is pruned.
        assert_eq!(rl.check("a1", "d1", now + Duration::seconds(61)), RateDecision::Granted);
    }

    #[test]
    fn domain_window_caps_ten_per_hour() {
        let rl = RateLimiter::new();
        let now = t0();
        for i in 0..10 {
            // Distinct automations, spaced past the per-automation window.
            let decision = rl.check(&format!("a{i}"), "d1", now + Duration::seconds(i * 61));
            assert_eq!(decision, RateDecision::Granted);
        }
        assert_eq!(
            rl.check("a11", "d1", now + Duration::seconds(11 * 61)),
            RateDecision::DeniedDomain
        );
        // Another domain is unaffected.
        assert_eq!(
            rl.check("b1", "d2", now + Duration::seconds(11 * 61)),
            RateDecision::Granted
        );
    }

    #[test]
    fn global_window_caps_thirty_per_hour() {
        let rl = RateLimiter::new();
        let now = t0();
        let mut granted = 0;
        for i in 0..40 {
            let automation = format!("a{i}");
            let domain = format!("d{}", i / 4); // stay under the domain cap
            if rl
                .check(&automation, &domain, now + Duration::seconds(i * 61))
                .is_granted()
            {
                granted += 1;
            }
        }
        assert_eq!(granted, 30);
    }

    #[test]
    fn clear_resets_everything() {
        let rl = RateLimiter::new();
        let now = t0();
        assert!(rl.check("a1", "d1", now).is_granted());
        assert!(!rl.check("a1", "d1", now).is_granted());
        rl.clear();
        assert!(rl.check("a1", "d1", now).is_granted());
    }

    #[test]
    fn denial_does_not_consume_quota() {
        let rl = RateLimiter::new();
        let now = t0();
        assert!(rl.check("a1", "d1", now).is_granted());
        // Denied attempts must not append to the domain/global lists.
        for _ in 0..20 {
            assert!(!rl.check("a1", "d1", now).is_granted());
        }
        assert!(rl.check("a2", "d1", now).is_granted());
    }
}
