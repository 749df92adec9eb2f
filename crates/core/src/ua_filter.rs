//! User-Agent allow/block lists consulted on connect, next to the IP gate.
//!
//! Patterns are case-insensitive substrings, or regexes when wrapped in
//! slashes (`/bot-\d+/`). An invalid regex never matches. With
//! `use_default_bots` the blocklist also carries [`DEFAULT_BOT_PATTERNS`].

use regex::RegexBuilder;
use serde::Deserialize;

use crate::ip_filter::{FilterDecision, FilterMode, FilterReason};

/// Crawlers, SEO tools, monitors, link unfurlers, AI scrapers, HTTP
/// libraries and scanners.
pub const DEFAULT_BOT_PATTERNS: &[&str] = &[
    // search engines
    "googlebot", "bingbot", "slurp", "duckduckbot", "baiduspider",
    "yandexbot", "sogou", "exabot", "facebot", "ia_archiver",
    // seo
    "semrushbot", "ahrefsbot", "mj12bot", "dotbot", "rogerbot",
    "screaming frog", "seokicks", "sistrix", "linkdexbot", "blexbot",
    // generic
    "bot/", "crawler", "spider", "scraper", "headless",
    "phantomjs", "selenium", "puppeteer", "playwright", "webdriver",
    // uptime
    "pingdom", "uptimerobot", "statuscake", "site24x7", "newrelic",
    "datadog", "gtmetrix", "pagespeed",
    // link previews
    "twitterbot", "linkedinbot", "pinterestbot", "telegrambot",
    "whatsapp", "slackbot", "discordbot", "applebot",
    // llm crawlers
    "gptbot", "chatgpt-user", "anthropic-ai", "claude-web",
    "perplexitybot", "ccbot", "bytespider", "cohere-ai",
    // http libraries
    "curl/", "wget/", "httpie/", "python-requests", "python-urllib",
    "axios/", "node-fetch", "go-http-client", "java/", "okhttp",
    "libwww-perl", "httpclient",
    // archives
    "archive.org_bot", "wayback", "commoncrawl",
    // scanners
    "nmap", "nikto", "sqlmap", "masscan", "zgrab",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UaVerdict {
    pub decision: FilterDecision,
    /// Pattern that decided the outcome, if any.
    pub pattern: Option<String>,
}

impl UaVerdict {
    fn allow(reason: FilterReason, pattern: Option<String>) -> Self {
        Self {
            decision: FilterDecision::Allow(reason),
            pattern,
        }
    }

    fn deny(reason: FilterReason, pattern: Option<String>) -> Self {
        Self {
            decision: FilterDecision::Deny(reason),
            pattern,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UaFilter {
    pub enabled: bool,
    pub mode: FilterMode,
    pub allowlist: Vec<String>,
    pub blocklist: Vec<String>,
    pub use_default_bots: bool,
}

impl Default for UaFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: FilterMode::Blocklist,
            allowlist: Vec::new(),
            blocklist: Vec::new(),
            use_default_bots: true,
        }
    }
}

impl UaFilter {
    /// An empty User-Agent is allowed: internal callers often send none.
    pub fn check(&self, user_agent: &str) -> UaVerdict {
        if !self.enabled || user_agent.trim().is_empty() {
            return UaVerdict::allow(FilterReason::Default, None);
        }

        let allowed = || first_match(user_agent, self.allowlist.iter().map(String::as_str));
        match self.mode {
            FilterMode::Allowlist => match allowed() {
                Some(pattern) => UaVerdict::allow(FilterReason::Allowlist, Some(pattern)),
                None => UaVerdict::deny(FilterReason::NotInAllowlist, None),
            },
            FilterMode::Blocklist => self.check_blocklist(user_agent),
            FilterMode::Both => match allowed() {
                Some(pattern) => UaVerdict::allow(FilterReason::Allowlist, Some(pattern)),
                None => self.check_blocklist(user_agent),
            },
        }
    }

    fn check_blocklist(&self, user_agent: &str) -> UaVerdict {
        if let Some(pattern) = first_match(user_agent, self.blocklist.iter().map(String::as_str)) {
            return UaVerdict::deny(FilterReason::Blocklist, Some(pattern));
        }
        if self.use_default_bots {
            if let Some(pattern) = first_match(user_agent, DEFAULT_BOT_PATTERNS.iter().copied()) {
                return UaVerdict::deny(FilterReason::DefaultBot, Some(pattern));
            }
        }
        UaVerdict::allow(FilterReason::Default, None)
    }
}

/// Whether the agent matches one of the default bot patterns.
pub fn is_bot(user_agent: &str) -> bool {
    first_match(user_agent, DEFAULT_BOT_PATTERNS.iter().copied()).is_some()
}

fn first_match<'a>(user_agent: &str, patterns: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let lowered = user_agent.to_lowercase();
    patterns
        .into_iter()
        .find(|pattern| matches_pattern(&lowered, pattern))
        .map(str::to_string)
}

fn matches_pattern(lowered: &str, pattern: &str) -> bool {
    match pattern
        .strip_prefix('/')
        .and_then(|p| p.strip_suffix('/'))
        .filter(|p| !p.is_empty())
    {
        Some(expr) => RegexBuilder::new(expr)
            .case_insensitive(true)
            .build()
            .is_ok_and(|re| re.is_match(lowered)),
        None => lowered.contains(&pattern.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
    const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

    fn filter(mode: FilterMode, allow: &[&str], block: &[&str]) -> UaFilter {
        UaFilter {
            enabled: true,
            mode,
            allowlist: allow.iter().map(|s| s.to_string()).collect(),
            blocklist: block.iter().map(|s| s.to_string()).collect(),
            use_default_bots: true,
        }
    }

    #[test]
    fn disabled_or_empty_agent_is_allowed() {
        let f = UaFilter::default();
        assert!(f.check(GOOGLEBOT).decision.is_allowed());

        let f = filter(FilterMode::Allowlist, &[], &[]);
        assert!(f.check("  ").decision.is_allowed());
    }

    #[test]
    fn blocklist_mode_tells_custom_from_default_bots() {
        let f = filter(FilterMode::Blocklist, &[], &["EvilScanner"]);
        assert_eq!(
            f.check("evilscanner/1.0"),
            UaVerdict::deny(FilterReason::Blocklist, Some("EvilScanner".into()))
        );
        assert_eq!(
            f.check(GOOGLEBOT),
            UaVerdict::deny(FilterReason::DefaultBot, Some("googlebot".into()))
        );
        assert_eq!(f.check(CHROME), UaVerdict::allow(FilterReason::Default, None));

        let lenient = UaFilter {
            use_default_bots: false,
            ..f
        };
        assert!(lenient.check(GOOGLEBOT).decision.is_allowed());
    }

    #[test]
    fn allowlist_mode_denies_everything_else() {
        let f = filter(FilterMode::Allowlist, &["chrome/"], &[]);
        assert_eq!(
            f.check(CHROME),
            UaVerdict::allow(FilterReason::Allowlist, Some("chrome/".into()))
        );
        assert_eq!(
            f.check("Mozilla/5.0 Firefox/126.0"),
            UaVerdict::deny(FilterReason::NotInAllowlist, None)
        );
    }

    #[test]
    fn both_mode_lets_allowlist_win() {
        let f = filter(FilterMode::Both, &["uptimerobot"], &["internal-checker"]);
        assert!(f.check("UptimeRobot/2.0").decision.is_allowed());
        assert_eq!(
            f.check("internal-checker/1").decision,
            FilterDecision::Deny(FilterReason::Blocklist)
        );
        assert_eq!(
            f.check("curl/8.4.0").decision,
            FilterDecision::Deny(FilterReason::DefaultBot)
        );
        assert!(f.check(CHROME).decision.is_allowed());
    }

    #[test]
    fn slash_wrapped_patterns_are_regexes() {
        let f = filter(FilterMode::Blocklist, &[], &[r"/agent-\d+/", "/[unclosed/"]);
        assert_eq!(
            f.check("Agent-42 build").decision,
            FilterDecision::Deny(FilterReason::Blocklist)
        );
        assert!(f.check("agent-x").decision.is_allowed());
        assert!(f.check("[unclosed").decision.is_allowed());
    }

    #[test]
    fn default_patterns_spot_common_bots() {
        assert!(is_bot(GOOGLEBOT));
        assert!(is_bot("python-requests/2.31"));
        assert!(!is_bot(CHROME));
    }
}
