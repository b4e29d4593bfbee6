//! CAPTCHA / challenge-page detection.
//!
//! Two layers: widget signatures (markup the known challenge stacks embed)
//! classify the challenge type; a text-phrase fallback catches interstitials
//! that hide their vendor. Pure over HTML so it is unit-testable without a
//! browser.

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptchaKind {
    Recaptcha,
    Hcaptcha,
    PerimeterX,
    Cloudflare,
    Unknown,
}

impl CaptchaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaKind::Recaptcha => "recaptcha",
            CaptchaKind::Hcaptcha => "hcaptcha",
            CaptchaKind::PerimeterX => "perimeter-x",
            CaptchaKind::Cloudflare => "cloudflare",
            CaptchaKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for CaptchaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaDetection {
    pub kind: CaptchaKind,
    /// The signature or phrase that tripped detection.
    pub signal: String,
}

/// Markup fragments the known challenge widgets embed.
const WIDGET_SIGNATURES: &[(&str, CaptchaKind)] = &[
    ("google.com/recaptcha", CaptchaKind::Recaptcha),
    ("g-recaptcha", CaptchaKind::Recaptcha),
    ("recaptcha/api.js", CaptchaKind::Recaptcha),
    ("hcaptcha.com", CaptchaKind::Hcaptcha),
    ("h-captcha", CaptchaKind::Hcaptcha),
    ("px-captcha", CaptchaKind::PerimeterX),
    ("perimeterx", CaptchaKind::PerimeterX),
    ("_px/captcha", CaptchaKind::PerimeterX),
    ("challenges.cloudflare.com", CaptchaKind::Cloudflare),
    ("cf-turnstile", CaptchaKind::Cloudflare),
    ("cf_chl_opt", CaptchaKind::Cloudflare),
];

/// Interstitial phrasing; matches classify as `Unknown` since the wording
/// alone does not identify the vendor.
const CHALLENGE_PHRASES: &[&str] = &[
    "verify you are human",
    "verify that you are human",
    "are you a robot",
    "prove you are not a robot",
    "unusual traffic from your computer network",
    "complete the security check",
    "checking your browser before accessing",
    "enable javascript and cookies to continue",
];

static PHRASE_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();

fn phrase_matcher() -> &'static AhoCorasick {
    PHRASE_MATCHER.get_or_init(|| {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(CHALLENGE_PHRASES)
            .expect("valid challenge phrases")
    })
}

/// Scan page HTML for a challenge. Widget signatures win over the phrase
/// heuristic so the classification is as specific as possible.
pub fn detect_captcha(html: &str) -> Option<CaptchaDetection> {
    let lower = html.to_lowercase();
    for (signature, kind) in WIDGET_SIGNATURES {
        if lower.contains(signature) {
            return Some(CaptchaDetection {
                kind: *kind,
                signal: (*signature).to_string(),
            });
        }
    }
    if let Some(m) = phrase_matcher().find(html) {
        return Some(CaptchaDetection {
            kind: CaptchaKind::Unknown,
            signal: CHALLENGE_PHRASES[m.pattern().as_usize()].to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_recaptcha() {
        let html = r#"<iframe src="https://www.google.com/recaptcha/api2/anchor"></iframe>"#;
        let det = detect_captcha(html).unwrap();
        assert_eq!(det.kind, CaptchaKind::Recaptcha);
    }

    #[test]
    fn classifies_hcaptcha() {
        let html = r#"<div class="h-captcha" data-sitekey="xyz"></div>"#;
        assert_eq!(detect_captcha(html).unwrap().kind, CaptchaKind::Hcaptcha);
    }

    #[test]
    fn classifies_perimeterx() {
        let html = r#"<div id="px-captcha"></div><script src="https://client.perimeterx.net/x.js"></script>"#;
        assert_eq!(detect_captcha(html).unwrap().kind, CaptchaKind::PerimeterX);
    }

    #[test]
    fn classifies_cloudflare() {
        let html = r#"<iframe src="https://challenges.cloudflare.com/turnstile/v0/x"></iframe>"#;
        assert_eq!(detect_captcha(html).unwrap().kind, CaptchaKind::Cloudflare);
    }

    #[test]
    fn phrase_fallback_is_unknown_and_case_insensitive() {
        let html = "<html><body><h1>Please VERIFY YOU ARE HUMAN to continue</h1></body></html>";
        let det = detect_captcha(html).unwrap();
        assert_eq!(det.kind, CaptchaKind::Unknown);
        assert_eq!(det.signal, "verify you are human");
    }

    #[test]
    fn clean_page_is_negative() {
        let html = "<html><body><article>Perfectly ordinary article about gardening.</article></body></html>";
        assert!(detect_captcha(html).is_none());
    }

    #[test]
    fn kind_wire_format_is_kebab_case() {
        assert_eq!(serde_json::to_string(&CaptchaKind::PerimeterX).unwrap(), "\"perimeter-x\"");
        assert_eq!(CaptchaKind::Cloudflare.as_str(), "cloudflare");
    }
}
