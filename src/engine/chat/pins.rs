// Lorekeep Runtime — Shared Pin Counters
//
// Two decaying counters per domain: advisory_pin (keep advisories in the
// prompt) and force_kb (force full KB context, with a reason). Both clamp
// to 3 and decay by one after each completed chat turn unless re-armed by
// detection on that turn. Owned by chat; decay is applied exactly once per
// turn.

use crate::atoms::constants::PIN_MAX;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct DomainPins {
    advisory_pin: u8,
    force_kb: u8,
    force_kb_reason: Option<String>,
}

#[derive(Default)]
pub struct PinCounters {
    domains: Mutex<HashMap<String, DomainPins>>,
}

impl PinCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_advisory(&self, domain_id: &str) {
        let mut domains = self.domains.lock();
        let pins = domains.entry(domain_id.to_string()).or_default();
        pins.advisory_pin = PIN_MAX;
    }

    pub fn arm_force_kb(&self, domain_id: &str, reason: &str) {
        let mut domains = self.domains.lock();
        let pins = domains.entry(domain_id.to_string()).or_default();
        pins.force_kb = PIN_MAX;
        pins.force_kb_reason = Some(reason.to_string());
    }

    pub fn advisory_pin(&self, domain_id: &str) -> u8 {
        self.domains.lock().get(domain_id).map(|p| p.advisory_pin).unwrap_or(0)
    }

    pub fn force_kb(&self, domain_id: &str) -> (u8, Option<String>) {
        self.domains
            .lock()
            .get(domain_id)
            .map(|p| (p.force_kb, p.force_kb_reason.clone()))
            .unwrap_or((0, None))
    }

    /// Called exactly once at the end of each completed chat turn.
    /// Counters re-armed during the turn were set to the ceiling, so the
    /// decrement leaves them active for the next turns.
    pub fn decay_turn(&self, domain_id: &str) {
        let mut domains = self.domains.lock();
        if let Some(pins) = domains.get_mut(domain_id) {
            pins.advisory_pin = pins.advisory_pin.saturating_sub(1);
            pins.force_kb = pins.force_kb.saturating_sub(1);
            if pins.force_kb == 0 {
                pins.force_kb_reason = None;
            }
            if pins.advisory_pin == 0 && pins.force_kb == 0 {
                domains.remove(domain_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_decay_to_zero_over_three_turns() {
        let pins = PinCounters::new();
        pins.arm_force_kb("d1", "deadline mentioned");
        assert_eq!(pins.force_kb("d1").0, 3);
        pins.decay_turn("d1");
        pins.decay_turn("d1");
        assert_eq!(pins.force_kb("d1").0, 1);
        assert!(pins.force_kb("d1").1.is_some());
        pins.decay_turn("d1");
        let (count, reason) = pins.force_kb("d1");
        assert_eq!(count, 0);
        assert!(reason.is_none());
    }

    #[test]
    fn rearming_resets_the_ceiling() {
        let pins = PinCounters::new();
        pins.arm_advisory("d1");
        pins.decay_turn("d1");
        pins.decay_turn("d1");
        assert_eq!(pins.advisory_pin("d1"), 1);
        pins.arm_advisory("d1");
        assert_eq!(pins.advisory_pin("d1"), 3);
    }

    #[test]
    fn domains_are_independent() {
        let pins = PinCounters::new();
        pins.arm_advisory("d1");
        pins.decay_turn("d2");
        assert_eq!(pins.advisory_pin("d1"), 3);
        assert_eq!(pins.advisory_pin("d2"), 0);
    }
}
