//! Merge gate: decides whether the collected markers may be published.

use std::collections::HashSet;

use fanout_core::ImageDigest;
use serde::{Deserialize, Serialize};

use crate::error::{CiResult, PipelineError};

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,

    /// Number of declared build targets.
    pub expected: usize,

    /// Number of markers found.
    pub found: usize,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    pub message: String,
}

/// Exactly one valid digest per declared target.
///
/// Only [`MergeGate::admit`] constructs this, so holding one means the gate
/// passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteDigestSet {
    digests: Vec<ImageDigest>,
}

impl CompleteDigestSet {
    /// Digests in marker-name order.
    pub fn digests(&self) -> &[ImageDigest] {
        &self.digests
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

pub struct MergeGate;

impl MergeGate {
    /// Check the markers against the declared target count and, when the
    /// jobs' own digests are known, against those digests.
    ///
    /// Gate rules:
    /// - at least one target must be declared
    /// - the marker count must equal the declared count (fewer means a job
    ///   did not finish, more means foreign or stale markers)
    /// - every marker must be a full digest payload
    /// - no marker may appear twice
    /// - with `reported`: one reported digest per declared target, and the
    ///   marker set must equal the reported set exactly
    pub fn evaluate(
        expected: usize,
        reported: Option<&[ImageDigest]>,
        markers: &[String],
    ) -> GateVerdict {
        let mut violations = Vec::new();

        if expected == 0 {
            violations.push("no build targets declared".to_string());
        }
        if markers.is_empty() {
            violations.push("no digests collected".to_string());
        }
        if markers.len() != expected {
            violations.push(format!(
                "expected {} digests, found {}",
                expected,
                markers.len()
            ));
        }

        let mut seen = HashSet::new();
        for marker in markers {
            if let Err(e) = ImageDigest::from_marker(marker) {
                violations.push(format!("marker {marker:?} is not a digest: {e}"));
            }
            if !seen.insert(marker.as_str()) {
                violations.push(format!("marker {marker} listed twice"));
            }
        }

        if let Some(reported) = reported {
            if reported.len() != expected {
                violations.push(format!(
                    "{} of {} jobs reported a digest",
                    reported.len(),
                    expected
                ));
            }
            let known: HashSet<&str> = reported.iter().map(|d| d.marker_name()).collect();
            for marker in markers {
                if !known.contains(marker.as_str()) {
                    violations.push(format!("marker {marker} was not reported by any job"));
                }
            }
            for digest in reported {
                if !seen.contains(digest.marker_name()) {
                    violations.push(format!("reported digest {digest} has no marker"));
                }
            }
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {expected} platform digests present")
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            expected,
            found: markers.len(),
            violations,
            message,
        }
    }

    /// Evaluate and, when the gate passes, hand out the digest set.
    pub fn admit(
        expected: usize,
        reported: Option<&[ImageDigest]>,
        markers: &[String],
    ) -> CiResult<CompleteDigestSet> {
        let verdict = Self::evaluate(expected, reported, markers);
        if !verdict.passed {
            return Err(PipelineError::MergeIncomplete {
                expected: verdict.expected,
                found: verdict.found,
                violations: verdict.violations,
            });
        }

        let digests = markers
            .iter()
            .map(|m| ImageDigest::from_marker(m))
            .collect::<fanout_core::Result<Vec<_>>>()?;
        Ok(CompleteDigestSet { digests })
    }
}
