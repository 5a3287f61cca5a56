//! Active query predicate for the console view.
//!
//! Filter values are validated before any network call; an unknown lane or
//! severity is a caller error, never a request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::LifecycleState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("unknown lifecycle lane '{0}'")]
    UnknownLane(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Result<Self, FilterError> {
        match value {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(FilterError::UnknownSeverity(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleFilters {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub lane: Option<LifecycleState>,
    #[serde(default)]
    pub severity: Option<Severity>,
}

impl ConsoleFilters {
    /// Build filters from raw caller input, rejecting unknown selector
    /// values before anything touches the network.
    pub fn parse(
        search: Option<&str>,
        lane: Option<&str>,
        severity: Option<&str>,
    ) -> Result<Self, FilterError> {
        let lane = match lane {
            Some(raw) => Some(
                LifecycleState::parse(raw)
                    .ok_or_else(|| FilterError::UnknownLane(raw.to_string()))?,
            ),
            None => None,
        };
        let severity = match severity {
            Some(raw) => Some(Severity::parse(raw)?),
            None => None,
        };
        let search = search
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);

        Ok(Self {
            search,
            lane,
            severity,
        })
    }

    /// Query parameters shared by the page fetch and the stream subscription.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(search) = &self.search {
            params.push(("search", search.clone()));
        }
        if let Some(lane) = self.lane {
            params.push(("lifecycle_state", lane.as_str().to_string()));
        }
        if let Some(severity) = self.severity {
            params.push(("severity", severity.as_str().to_string()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_selectors() {
        let filters = ConsoleFilters::parse(Some("  payment  "), Some("active"), Some("high"))
            .expect("valid filters");
        assert_eq!(filters.search.as_deref(), Some("payment"));
        assert_eq!(filters.lane, Some(LifecycleState::Active));
        assert_eq!(filters.severity, Some(Severity::High));
    }

    #[test]
    fn parse_rejects_unknown_lane_before_any_network_call() {
        let err = ConsoleFilters::parse(None, Some("limbo"), None).expect_err("invalid lane");
        assert_eq!(err, FilterError::UnknownLane("limbo".to_string()));
    }

    #[test]
    fn blank_search_is_treated_as_absent() {
        let filters = ConsoleFilters::parse(Some("   "), None, None).expect("valid");
        assert!(filters.search.is_none());
        assert!(filters.query_params().is_empty());
    }

    #[test]
    fn query_params_cover_every_set_field() {
        let filters = ConsoleFilters::parse(Some("db"), Some("draft"), Some("critical"))
            .expect("valid");
        let params = filters.query_params();
        assert_eq!(params.len(), 3);
        assert!(params.contains(&("lifecycle_state", "draft".to_string())));
        assert!(params.contains(&("severity", "critical".to_string())));
    }
}
