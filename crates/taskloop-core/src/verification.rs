//! Verification response parsing and the checker prompt.
//!
//! After an iteration claims completion, a separate checker invocation counts
//! the checklist items in the target files and answers with one of:
//!
//! - `VERIFIED: 0 unchecked, N checked`
//! - `INCOMPLETE: N unchecked, M checked`
//!
//! Anything else is reported as unparseable (`-1, -1`), which callers treat as
//! "not verified" without confusing it with a real incomplete count.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::types::UNPARSEABLE_COUNT;

static VERIFIED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"VERIFIED:\s*0\s+unchecked,\s*(\d+)\s+checked").expect("valid regex")
});

static INCOMPLETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"INCOMPLETE:\s*(\d+)\s+unchecked,\s*(\d+)\s+checked").expect("valid regex")
});

/// Parse a checker response into `(verified, unchecked, checked)`.
///
/// `VERIFIED` is only recognised with an unchecked count of exactly zero. If
/// both forms appear, `VERIFIED` is taken.
///
/// # Example
/// ```
/// use taskloop_core::verification::parse_verification_response;
///
/// assert_eq!(parse_verification_response("VERIFIED: 0 unchecked, 5 checked"), (true, 0, 5));
/// assert_eq!(parse_verification_response("INCOMPLETE: 3 unchecked, 7 checked"), (false, 3, 7));
/// assert_eq!(parse_verification_response("garbage"), (false, -1, -1));
/// ```
pub fn parse_verification_response(output: &str) -> (bool, i64, i64) {
    if let Some(caps) = VERIFIED_RE.captures(output) {
        if let Some(checked) = parse_count(caps.get(1).map(|m| m.as_str())) {
            return (true, 0, checked);
        }
    }

    if let Some(caps) = INCOMPLETE_RE.captures(output) {
        let unchecked = parse_count(caps.get(1).map(|m| m.as_str()));
        let checked = parse_count(caps.get(2).map(|m| m.as_str()));
        if let (Some(unchecked), Some(checked)) = (unchecked, checked) {
            return (false, unchecked, checked);
        }
    }

    (false, UNPARSEABLE_COUNT, UNPARSEABLE_COUNT)
}

fn parse_count(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.parse().ok())
}

/// Build the checker prompt for a set of target files.
pub fn verification_prompt(files: &[impl AsRef<Path>]) -> String {
    let refs = if files.is_empty() {
        "(no files)".to_string()
    } else {
        files
            .iter()
            .map(|f| format!("@{}", f.as_ref().display()))
            .collect::<Vec<_>>()
            .join(" ")
    };

    format!(
        r"{refs}

You are a verification agent. Do not modify any files.

Read every file listed above and count its checklist items:
- `[ ]` and `[~]` items are unchecked.
- `[x]` items are checked.
- Ignore `[ ]?` manual QA items.

Respond with exactly one line and nothing else:
- If no unchecked items remain: VERIFIED: 0 unchecked, <checked> checked
- Otherwise: INCOMPLETE: <unchecked> unchecked, <checked> checked"
    )
}
