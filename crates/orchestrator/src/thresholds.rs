//! Participant-count thresholds declared on a position.

use std::fmt;

use crate::stager::HookFn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdKind {
    Min,
    Max,
    Exact,
}

impl ThresholdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdKind::Min => "min",
            ThresholdKind::Max => "max",
            ThresholdKind::Exact => "exact",
        }
    }

    fn violated(&self, limit: usize, count: usize) -> bool {
        match self {
            ThresholdKind::Min => count < limit,
            ThresholdKind::Max => count > limit,
            ThresholdKind::Exact => count != limit,
        }
    }
}

#[derive(Clone)]
pub struct Threshold {
    pub limit: usize,
    pub on_violation: Option<HookFn>,
    pub on_recovery: Option<HookFn>,
}

impl Threshold {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            on_violation: None,
            on_recovery: None,
        }
    }

    pub fn on_violation(mut self, hook: HookFn) -> Self {
        self.on_violation = Some(hook);
        self
    }

    pub fn on_recovery(mut self, hook: HookFn) -> Self {
        self.on_recovery = Some(hook);
        self
    }
}

impl fmt::Debug for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Threshold")
            .field("limit", &self.limit)
            .field("on_violation", &self.on_violation.is_some())
            .field("on_recovery", &self.on_recovery.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParticipantThresholds {
    pub min: Option<Threshold>,
    pub max: Option<Threshold>,
    pub exact: Option<Threshold>,
}

impl ParticipantThresholds {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none() && self.exact.is_none()
    }

    fn declared(&self) -> impl Iterator<Item = (ThresholdKind, &Threshold)> {
        [
            (ThresholdKind::Min, self.min.as_ref()),
            (ThresholdKind::Max, self.max.as_ref()),
            (ThresholdKind::Exact, self.exact.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, t)| t.map(|t| (kind, t)))
    }
}

/// A threshold crossed in either direction.
#[derive(Clone)]
pub struct ThresholdChange {
    pub kind: ThresholdKind,
    pub limit: usize,
    pub count: usize,
    pub violated: bool,
    pub hook: Option<HookFn>,
}

impl fmt::Debug for ThresholdChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdChange")
            .field("kind", &self.kind)
            .field("limit", &self.limit)
            .field("count", &self.count)
            .field("violated", &self.violated)
            .finish()
    }
}

/// Tracks which thresholds of the current position are violated so each
/// violation fires once and recovery re-arms it.
#[derive(Debug, Clone, Default)]
pub struct ThresholdMonitor {
    thresholds: ParticipantThresholds,
    violated: [bool; 3],
}

impl ThresholdMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the watched thresholds, e.g. on entering a new step.
    pub fn set(&mut self, thresholds: ParticipantThresholds) {
        self.thresholds = thresholds;
        self.violated = [false; 3];
    }

    pub fn clear(&mut self) {
        self.set(ParticipantThresholds::default());
    }

    /// Compare against a fresh participant count and report the edges.
    pub fn evaluate(&mut self, count: usize) -> Vec<ThresholdChange> {
        let mut changes = Vec::new();
        for (kind, threshold) in self.thresholds.declared() {
            let slot = &mut self.violated[kind as usize];
            let now = kind.violated(threshold.limit, count);
            if now == *slot {
                continue;
            }
            *slot = now;
            changes.push(ThresholdChange {
                kind,
                limit: threshold.limit,
                count,
                violated: now,
                hook: if now {
                    threshold.on_violation.clone()
                } else {
                    threshold.on_recovery.clone()
                },
            });
        }
        changes
    }

    pub fn is_violated(&self) -> bool {
        self.violated.iter().any(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min(limit: usize) -> ParticipantThresholds {
        ParticipantThresholds {
            min: Some(Threshold::new(limit)),
            ..Default::default()
        }
    }

    #[test]
    fn test_violation_fires_once_and_rearms() {
        let mut monitor = ThresholdMonitor::new();
        monitor.set(min(2));

        assert!(monitor.evaluate(2).is_empty());

        let changes = monitor.evaluate(1);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].violated);
        assert!(monitor.is_violated());

        assert!(monitor.evaluate(1).is_empty());
        assert!(monitor.evaluate(0).is_empty());

        let changes = monitor.evaluate(3);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].violated);
        assert!(!monitor.is_violated());

        assert_eq!(monitor.evaluate(1).len(), 1);
    }

    #[test]
    fn test_max_and_exact() {
        let mut monitor = ThresholdMonitor::new();
        monitor.set(ParticipantThresholds {
            max: Some(Threshold::new(3)),
            exact: Some(Threshold::new(2)),
            ..Default::default()
        });

        let changes = monitor.evaluate(4);
        let kinds: Vec<ThresholdKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ThresholdKind::Max, ThresholdKind::Exact]);

        let changes = monitor.evaluate(2);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| !c.violated));
    }

    #[test]
    fn test_set_resets_state() {
        let mut monitor = ThresholdMonitor::new();
        monitor.set(min(2));
        monitor.evaluate(1);
        assert!(monitor.is_violated());

        monitor.clear();
        assert!(!monitor.is_violated());
        assert!(monitor.evaluate(0).is_empty());
    }
}
