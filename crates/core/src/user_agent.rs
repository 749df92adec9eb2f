//! Coarse device/browser/OS classification from a User-Agent string.

use pocketping_protocol::SessionMetadata;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub device_type: Option<&'static str>,
    pub browser: Option<&'static str>,
    pub os: Option<&'static str>,
}

pub fn parse(user_agent: &str) -> UserAgentInfo {
    if user_agent.trim().is_empty() {
        return UserAgentInfo::default();
    }
    let ua = user_agent.to_ascii_lowercase();
    let has = |needle: &str| ua.contains(needle);

    let device_type = if has("ipad") || has("tablet") {
        "tablet"
    } else if has("mobile") || has("android") || has("iphone") || has("ipod") {
        "mobile"
    } else {
        "desktop"
    };

    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari.
    let browser = if has("firefox") {
        Some("Firefox")
    } else if has("edg") {
        Some("Edge")
    } else if has("opr") || has("opera") {
        Some("Opera")
    } else if has("chrome") {
        Some("Chrome")
    } else if has("safari") {
        Some("Safari")
    } else {
        None
    };

    // iOS before macOS: iOS agents contain "Mac OS X".
    let os = if has("iphone") || has("ipad") || has("ipod") {
        Some("iOS")
    } else if has("android") {
        Some("Android")
    } else if has("windows") {
        Some("Windows")
    } else if has("mac os") || has("macos") {
        Some("macOS")
    } else if has("linux") {
        Some("Linux")
    } else {
        None
    };

    UserAgentInfo {
        device_type: Some(device_type),
        browser,
        os,
    }
}

/// Fill `device_type`, `browser` and `os` the client did not send itself.
pub fn enrich(metadata: &mut SessionMetadata) {
    let Some(user_agent) = metadata.user_agent.as_deref() else {
        return;
    };
    let info = parse(user_agent);
    if metadata.device_type.is_none() {
        metadata.device_type = info.device_type.map(str::to_string);
    }
    if metadata.browser.is_none() {
        metadata.browser = info.browser.map(str::to_string);
    }
    if metadata.os.is_none() {
        metadata.os = info.os.map(str::to_string);
    }
}
