//! Widget version gate.
//!
//! Versions are compared leniently: a leading `v`, missing minor/patch
//! parts and pre-release suffixes are accepted.

use pocketping_protocol::{VersionStatus, VersionWarning, WarningSeverity};
use semver::Version;

pub const DEFAULT_UPGRADE_URL: &str = "https://docs.pocketping.io/widget/installation";

#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub status: VersionStatus,
    pub message: Option<String>,
    pub min_version: Option<String>,
    pub latest_version: Option<String>,
    pub can_continue: bool,
}

impl VersionCheck {
    fn ok(min: Option<&str>, latest: Option<&str>) -> Self {
        Self {
            status: VersionStatus::Ok,
            message: None,
            min_version: min.map(str::to_string),
            latest_version: latest.map(str::to_string),
            can_continue: true,
        }
    }

    /// Response headers advertising the check result.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let status = match self.status {
            VersionStatus::Ok => "ok",
            VersionStatus::Outdated => "outdated",
            VersionStatus::Deprecated => "deprecated",
            VersionStatus::Unsupported => "unsupported",
        };
        let mut headers = vec![("X-PocketPing-Version-Status", status.to_string())];
        if let Some(min) = &self.min_version {
            headers.push(("X-PocketPing-Min-Version", min.clone()));
        }
        if let Some(latest) = &self.latest_version {
            headers.push(("X-PocketPing-Latest-Version", latest.clone()));
        }
        if let Some(message) = &self.message {
            headers.push(("X-PocketPing-Version-Message", message.clone()));
        }
        headers
    }
}

/// Parse `v1.2`, `1`, `2.0.0-beta.1` and friends. Garbage parses as 0.0.0.
pub fn parse_version(raw: &str) -> Version {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let (core, _pre) = trimmed.split_once('-').unwrap_or((trimmed, ""));

    let mut parts = core
        .split('.')
        .map(|p| p.trim().parse::<u64>().unwrap_or(0));
    Version::new(
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Classify a widget version against the configured bounds.
///
/// A missing widget version is treated as compatible.
pub fn check_widget_version(
    widget: Option<&str>,
    min: Option<&str>,
    latest: Option<&str>,
    custom_message: Option<&str>,
) -> VersionCheck {
    let min = min.filter(|v| !v.is_empty());
    let latest = latest.filter(|v| !v.is_empty());

    let Some(widget) = widget.filter(|v| !v.is_empty()) else {
        return VersionCheck::ok(min, latest);
    };
    if min.is_none() && latest.is_none() {
        return VersionCheck::ok(None, None);
    }

    let current = parse_version(widget);

    if let Some(min) = min {
        if current < parse_version(min) {
            return VersionCheck {
                status: VersionStatus::Unsupported,
                message: Some(custom_message.map(str::to_string).unwrap_or_else(|| {
                    format!("Widget version {widget} is no longer supported. Minimum version: {min}")
                })),
                min_version: Some(min.to_string()),
                latest_version: latest.map(str::to_string),
                can_continue: false,
            };
        }
    }

    if let Some(latest) = latest {
        let newest = parse_version(latest);
        if current < newest {
            let (status, message) = if current.major < newest.major {
                (
                    VersionStatus::Deprecated,
                    custom_message.map(str::to_string).unwrap_or_else(|| {
                        format!("Widget version {widget} is deprecated. Please update to {latest}")
                    }),
                )
            } else {
                (
                    VersionStatus::Outdated,
                    format!("A newer widget version {latest} is available"),
                )
            };
            return VersionCheck {
                status,
                message: Some(message),
                min_version: min.map(str::to_string),
                latest_version: Some(latest.to_string()),
                can_continue: true,
            };
        }
    }

    VersionCheck::ok(min, latest)
}

/// Build the `version_warning` payload pushed to the widget.
pub fn version_warning(check: &VersionCheck, current: &str, upgrade_url: Option<&str>) -> VersionWarning {
    let severity = match check.status {
        VersionStatus::Deprecated => WarningSeverity::Warning,
        VersionStatus::Unsupported => WarningSeverity::Error,
        VersionStatus::Ok | VersionStatus::Outdated => WarningSeverity::Info,
    };
    VersionWarning {
        severity,
        message: check.message.clone().unwrap_or_default(),
        current_version: current.to_string(),
        min_version: check.min_version.clone(),
        latest_version: check.latest_version.clone(),
        can_continue: check.can_continue,
        upgrade_url: Some(upgrade_url.unwrap_or(DEFAULT_UPGRADE_URL).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lenient_versions() {
        assert_eq!(parse_version("v1.2"), Version::new(1, 2, 0));
        assert_eq!(parse_version("2.0.0-beta.1"), Version::new(2, 0, 0));
        assert_eq!(parse_version("nonsense"), Version::new(0, 0, 0));
    }

    #[test]
    fn missing_widget_version_is_ok() {
        let check = check_widget_version(None, Some("1.0.0"), Some("2.0.0"), None);
        assert_eq!(check.status, VersionStatus::Ok);
        assert!(check.can_continue);
    }

    #[test]
    fn below_minimum_is_unsupported() {
        let check = check_widget_version(Some("0.9.0"), Some("1.0.0"), None, None);
        assert_eq!(check.status, VersionStatus::Unsupported);
        assert!(!check.can_continue);
        assert!(check.message.unwrap().contains("Minimum version: 1.0.0"));
    }

    #[test]
    fn major_behind_is_deprecated_minor_behind_is_outdated() {
        let deprecated = check_widget_version(Some("1.5.0"), None, Some("2.1.0"), None);
        assert_eq!(deprecated.status, VersionStatus::Deprecated);

        let outdated = check_widget_version(Some("2.0.3"), None, Some("2.1.0"), None);
        assert_eq!(outdated.status, VersionStatus::Outdated);
        assert!(outdated.can_continue);

        let current = check_widget_version(Some("2.1.0"), Some("1.0.0"), Some("2.1.0"), None);
        assert_eq!(current.status, VersionStatus::Ok);
    }

    #[test]
    fn custom_message_overrides_defaults() {
        let check = check_widget_version(Some("0.1"), Some("1.0"), None, Some("Please upgrade"));
        assert_eq!(check.message.as_deref(), Some("Please upgrade"));
    }

    #[test]
    fn warning_severity_follows_status() {
        let check = check_widget_version(Some("1.0.0"), None, Some("3.0.0"), None);
        let warning = version_warning(&check, "1.0.0", None);
        assert_eq!(warning.severity, WarningSeverity::Warning);
        assert_eq!(warning.upgrade_url.as_deref(), Some(DEFAULT_UPGRADE_URL));

        let headers = check.headers();
        assert_eq!(headers[0], ("X-PocketPing-Version-Status", "deprecated".to_string()));
    }
}
