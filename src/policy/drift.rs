//! Drift detection against a rolling per-route baseline
//!
//! Observational only: a verdict is recorded on the telemetry event and the
//! pipeline decides what `drift_strict` routes do with it.

use crate::domain::{DriftDetectionSettings, DriftSensitivity, MicroUsd, RouteName};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftBaseline {
    pub last_fingerprint: Option<String>,
    pub sample_count: u64,
}

/// What the provider actually did, compared to what the route expected
#[derive(Debug, Clone, Copy)]
pub struct DriftObservation<'a> {
    pub expected_model: &'a str,
    pub actual_model: Option<&'a str>,
    pub fingerprint: Option<&'a str>,
    pub expected_cost: MicroUsd,
    pub actual_cost: MicroUsd,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriftReason {
    ModelMismatch { expected: String, actual: String },
    FingerprintChanged { previous: String, current: String },
    CostAnomaly { percent: f64 },
}

impl DriftReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelMismatch { .. } => "model_mismatch",
            Self::FingerprintChanged { .. } => "fingerprint_changed",
            Self::CostAnomaly { .. } => "cost_anomaly",
        }
    }
}

impl fmt::Display for DriftReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelMismatch { expected, actual } => {
                write!(f, "model_mismatch: expected {expected}, got {actual}")
            }
            Self::FingerprintChanged { previous, current } => {
                write!(f, "fingerprint_changed: {previous} -> {current}")
            }
            Self::CostAnomaly { percent } => write!(f, "cost_anomaly: {percent:.1}%"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftVerdict {
    pub detected: bool,
    pub reason: Option<DriftReason>,
}

impl DriftVerdict {
    fn clean() -> Self {
        Self::default()
    }

    fn drifted(reason: DriftReason) -> Self {
        Self {
            detected: true,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Default)]
pub struct DriftDetector {
    baselines: Mutex<HashMap<RouteName, DriftBaseline>>,
}

impl DriftDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn baseline(&self, route: &RouteName) -> Option<DriftBaseline> {
        self.baselines.lock().get(route).cloned()
    }

    pub fn detect(
        &self,
        route: &RouteName,
        settings: &DriftDetectionSettings,
        observation: DriftObservation<'_>,
    ) -> DriftVerdict {
        if !settings.enabled {
            return DriftVerdict::clean();
        }

        if let Some(actual) = observation.actual_model {
            let matches = match settings.sensitivity {
                DriftSensitivity::High => actual == observation.expected_model,
                DriftSensitivity::Low | DriftSensitivity::Medium => {
                    actual.starts_with(observation.expected_model)
                }
            };
            if !matches {
                return DriftVerdict::drifted(DriftReason::ModelMismatch {
                    expected: observation.expected_model.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let mut baselines = self.baselines.lock();
        let baseline = baselines.entry(route.clone()).or_default();

        let track_fingerprint = settings.sensitivity != DriftSensitivity::Low;
        if track_fingerprint {
            if let (Some(current), Some(previous)) =
                (observation.fingerprint, baseline.last_fingerprint.as_deref())
            {
                if current != previous {
                    return DriftVerdict::drifted(DriftReason::FingerprintChanged {
                        previous: previous.to_string(),
                        current: current.to_string(),
                    });
                }
            }
        }

        if !observation.expected_cost.is_zero() {
            let expected = observation.expected_cost.as_micros() as f64;
            let actual = observation.actual_cost.as_micros() as f64;
            let ratio = (actual - expected).abs() / expected;
            if ratio > settings.cost_anomaly_threshold {
                return DriftVerdict::drifted(DriftReason::CostAnomaly {
                    percent: ratio * 100.0,
                });
            }
        }

        if track_fingerprint {
            if let Some(current) = observation.fingerprint {
                baseline.last_fingerprint = Some(current.to_string());
            }
        }
        baseline.sample_count += 1;
        DriftVerdict::clean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> RouteName {
        RouteName::try_new("chat".to_string()).unwrap()
    }

    fn enabled(sensitivity: DriftSensitivity) -> DriftDetectionSettings {
        DriftDetectionSettings {
            enabled: true,
            sensitivity,
            cost_anomaly_threshold: 0.5,
        }
    }

    fn observation<'a>(model: Option<&'a str>, fingerprint: Option<&'a str>) -> DriftObservation<'a> {
        DriftObservation {
            expected_model: "gpt-4o",
            actual_model: model,
            fingerprint,
            expected_cost: MicroUsd::from_micros(1000),
            actual_cost: MicroUsd::from_micros(1100),
        }
    }

    #[test]
    fn disabled_routes_never_drift() {
        let detector = DriftDetector::new();
        let verdict = detector.detect(
            &route(),
            &DriftDetectionSettings::default(),
            observation(Some("other-model"), None),
        );
        assert!(!verdict.detected);
        assert!(detector.baseline(&route()).is_none());
    }

    #[test]
    fn model_mismatch_respects_sensitivity() {
        let detector = DriftDetector::new();
        let snapshot = observation(Some("gpt-4o-2024-08-06"), None);
        assert!(!detector.detect(&route(), &enabled(DriftSensitivity::Medium), snapshot).detected);

        let verdict = detector.detect(&route(), &enabled(DriftSensitivity::High), snapshot);
        assert_eq!(verdict.reason.map(|r| r.code()), Some("model_mismatch"));
    }

    #[test]
    fn fingerprint_change_is_flagged_after_a_baseline_exists() {
        let detector = DriftDetector::new();
        let settings = enabled(DriftSensitivity::Medium);
        assert!(!detector.detect(&route(), &settings, observation(Some("gpt-4o"), Some("fp_a"))).detected);
        assert_eq!(
            detector.baseline(&route()),
            Some(DriftBaseline {
                last_fingerprint: Some("fp_a".to_string()),
                sample_count: 1
            })
        );

        let verdict = detector.detect(&route(), &settings, observation(Some("gpt-4o"), Some("fp_b")));
        assert_eq!(verdict.reason.map(|r| r.code()), Some("fingerprint_changed"));
        // Drifted calls leave the baseline untouched
        assert_eq!(detector.baseline(&route()).map(|b| b.sample_count), Some(1));
    }

    #[test]
    fn low_sensitivity_ignores_fingerprints() {
        let detector = DriftDetector::new();
        let settings = enabled(DriftSensitivity::Low);
        detector.detect(&route(), &settings, observation(None, Some("fp_a")));
        assert!(!detector.detect(&route(), &settings, observation(None, Some("fp_b"))).detected);
    }

    #[test]
    fn cost_anomaly_reports_percentage() {
        let detector = DriftDetector::new();
        let mut snapshot = observation(Some("gpt-4o"), None);
        snapshot.actual_cost = MicroUsd::from_micros(2500);
        let verdict = detector.detect(&route(), &enabled(DriftSensitivity::Medium), snapshot);
        assert_eq!(verdict.reason, Some(DriftReason::CostAnomaly { percent: 150.0 }));
    }
}
