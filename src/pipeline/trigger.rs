//! Threshold trigger that starts a downstream stage while its upstream is
//! still producing.

use serde::Serialize;

/// What the supervisor saw of the upstream stage at one poll or exit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamObservation {
    /// Units currently in the upstream artifact
    pub produced: u64,
    /// Whether the upstream worker is still alive
    pub worker_running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReason {
    ThresholdCrossed,
    UpstreamFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    Start(StartReason),
    Wait,
}

/// Fires at most once per downstream stage of an item.
#[derive(Debug, Clone)]
pub struct ThresholdTrigger {
    threshold: u64,
    fired: bool,
}

impl ThresholdTrigger {
    /// A threshold of 0 behaves like 1: the downstream never starts on nothing.
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            fired: false,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn observe(&mut self, observation: UpstreamObservation) -> TriggerDecision {
        if self.fired {
            return TriggerDecision::Wait;
        }
        let reason = if observation.worker_running {
            (observation.produced >= self.threshold).then_some(StartReason::ThresholdCrossed)
        } else {
            (observation.produced > 0).then_some(StartReason::UpstreamFinished)
        };
        match reason {
            Some(reason) => {
                self.fired = true;
                TriggerDecision::Start(reason)
            }
            None => TriggerDecision::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(produced: u64) -> UpstreamObservation {
        UpstreamObservation {
            produced,
            worker_running: true,
        }
    }

    fn exited(produced: u64) -> UpstreamObservation {
        UpstreamObservation {
            produced,
            worker_running: false,
        }
    }

    #[test]
    fn test_fires_once_when_threshold_crossed() {
        let mut trigger = ThresholdTrigger::new(20);
        assert_eq!(trigger.observe(running(15)), TriggerDecision::Wait);
        assert_eq!(
            trigger.observe(running(25)),
            TriggerDecision::Start(StartReason::ThresholdCrossed)
        );
        assert_eq!(trigger.observe(running(40)), TriggerDecision::Wait);
        assert_eq!(trigger.observe(exited(60)), TriggerDecision::Wait);
        assert!(trigger.has_fired());
    }

    #[test]
    fn test_fires_when_upstream_finishes_below_threshold() {
        let mut trigger = ThresholdTrigger::new(20);
        assert_eq!(trigger.observe(running(5)), TriggerDecision::Wait);
        assert_eq!(
            trigger.observe(exited(7)),
            TriggerDecision::Start(StartReason::UpstreamFinished)
        );
    }

    #[test]
    fn test_never_fires_on_empty_upstream() {
        let mut trigger = ThresholdTrigger::new(20);
        assert_eq!(trigger.observe(exited(0)), TriggerDecision::Wait);
        assert!(!trigger.has_fired());
    }

    #[test]
    fn test_zero_threshold_needs_one_unit() {
        let mut trigger = ThresholdTrigger::new(0);
        assert_eq!(trigger.threshold(), 1);
        assert_eq!(trigger.observe(running(0)), TriggerDecision::Wait);
        assert_eq!(
            trigger.observe(running(1)),
            TriggerDecision::Start(StartReason::ThresholdCrossed)
        );
    }
}
