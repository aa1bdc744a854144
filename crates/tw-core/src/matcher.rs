//! Window similarity matching.
//!
//! Pure, stateless scoring between tab sets. After a browser restart every
//! window/tab/group gets a fresh process-assigned ID, so the only way to
//! reconnect persisted state to live state is fuzzy similarity over the tab
//! URLs themselves. All functions here take plain value objects and do no I/O.

use std::collections::{HashMap, HashSet};

/// Minimum composite score for a window pair to be accepted as a match.
///
/// Tunable in principle, fixed in practice: downstream behavior (and the
/// tests) depend on this exact value.
pub const MATCH_THRESHOLD: f64 = 0.35;

/// Composite score weights: domain Jaccard, path Jaccard, count similarity,
/// exact-URL Jaccard. Domain overlap is the strongest restart-survives signal;
/// exact URLs are too strict alone (pages navigate); count and path are
/// tie-breakers. Must sum to 1.
pub const WEIGHT_DOMAIN: f64 = 0.4;
pub const WEIGHT_PATH: f64 = 0.3;
pub const WEIGHT_COUNT: f64 = 0.15;
pub const WEIGHT_URL: f64 = 0.15;

/// Schemes the browser cannot recreate identically; tabs with these URLs are
/// excluded from all similarity computation.
const INTERNAL_SCHEMES: &[&str] = &[
    "chrome://",
    "chrome-extension://",
    "about:",
    "edge://",
    "brave://",
    "vivaldi://",
    "opera://",
    "devtools://",
];

/// Whether a URL participates in matching and restoration.
#[must_use]
pub fn is_valid_url(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    !INTERNAL_SCHEMES
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

/// Extract the host from a URL, without a URL-parsing dependency.
///
/// Accepts `scheme://host/path?query` and returns the host portion (with any
/// port stripped). Returns `None` when no `://` separator exists.
fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if host.is_empty() {
        return None;
    }
    // Strip a port suffix; IPv6 literals keep their brackets.
    if host.starts_with('[') {
        return Some(host.split(']').next().unwrap_or(host));
    }
    Some(host.split(':').next().unwrap_or(host))
}

/// Extract `host + path` (no query/fragment) for the path-level Jaccard set.
fn host_and_path(url: &str) -> Option<String> {
    let host = host_of(url)?;
    let rest = url.split_once("://")?.1;
    let path = rest
        .strip_prefix(host)
        .map_or("", |p| p.split(['?', '#']).next().unwrap_or(p));
    let path = path.trim_end_matches('/');
    Some(format!("{host}{path}"))
}

/// Window signature: a cheap persisted fingerprint of a window's tab-domain
/// histogram. Not used for matching directly; stored for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSignature {
    /// Base-36 rolling hash over the sorted `(domain, count)` pairs.
    pub hash: String,
    /// Up to five domains, most tabs first.
    pub top_domains: Vec<String>,
    /// Number of valid (non-internal) tabs.
    pub valid_tab_count: usize,
}

/// Compute a deterministic signature over a window's tab URLs.
#[must_use]
pub fn generate_window_signature<S: AsRef<str>>(urls: &[S]) -> WindowSignature {
    let mut histogram: HashMap<String, usize> = HashMap::new();
    let mut valid_tab_count = 0usize;
    for url in urls {
        let url = url.as_ref();
        if !is_valid_url(url) {
            continue;
        }
        valid_tab_count += 1;
        if let Some(host) = host_of(url) {
            *histogram.entry(host.to_string()).or_insert(0) += 1;
        }
    }

    let mut pairs: Vec<(String, usize)> = histogram.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serialized = String::new();
    for (domain, count) in &pairs {
        serialized.push_str(domain);
        serialized.push(':');
        serialized.push_str(&count.to_string());
        serialized.push(';');
    }

    let mut top: Vec<(String, usize)> = pairs;
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(5);

    WindowSignature {
        hash: base36(rolling_hash(serialized.as_bytes())),
        top_domains: top.into_iter().map(|(domain, _)| domain).collect(),
        valid_tab_count,
    }
}

/// Simple polynomial rolling hash (base 31, wrapping u64).
fn rolling_hash(bytes: &[u8]) -> u64 {
    let mut hash = 0u64;
    for &b in bytes {
        hash = hash.wrapping_mul(31).wrapping_add(u64::from(b));
    }
    hash
}

/// Render a u64 in lowercase base-36.
fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Composite similarity in `[0, 1]` between two tab-URL collections.
///
/// Both empty after validity filtering is a perfect trivial match (1.0);
/// exactly one empty scores 0. The formula is symmetric in its arguments.
#[must_use]
pub fn calculate_match_score<A: AsRef<str>, B: AsRef<str>>(prev: &[A], curr: &[B]) -> f64 {
    let prev: Vec<&str> = prev
        .iter()
        .map(AsRef::as_ref)
        .filter(|u| is_valid_url(u))
        .collect();
    let curr: Vec<&str> = curr
        .iter()
        .map(AsRef::as_ref)
        .filter(|u| is_valid_url(u))
        .collect();

    match (prev.is_empty(), curr.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        (false, false) => {}
    }

    let domains = |urls: &[&str]| -> HashSet<String> {
        urls.iter()
            .filter_map(|u| host_of(u).map(str::to_string))
            .collect()
    };
    let paths = |urls: &[&str]| -> HashSet<String> {
        urls.iter().filter_map(|u| host_and_path(u)).collect()
    };
    let exact = |urls: &[&str]| -> HashSet<String> {
        urls.iter().map(|u| (*u).to_string()).collect()
    };

    let domain_score = jaccard(&domains(&prev), &domains(&curr));
    let path_score = jaccard(&paths(&prev), &paths(&curr));
    let url_score = jaccard(&exact(&prev), &exact(&curr));

    let max_count = prev.len().max(curr.len());
    let count_score = if max_count == 0 {
        1.0
    } else {
        1.0 - (prev.len().abs_diff(curr.len()) as f64 / max_count as f64)
    };

    WEIGHT_DOMAIN * domain_score
        + WEIGHT_PATH * path_score
        + WEIGHT_COUNT * count_score
        + WEIGHT_URL * url_score
}

/// A window identified by its browser-assigned ID plus its tab URLs.
#[derive(Debug, Clone)]
pub struct WindowTabSet {
    pub window_id: i64,
    pub urls: Vec<String>,
}

/// An accepted orphan→current pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMatch {
    pub orphan_window_id: i64,
    pub current_window_id: i64,
    pub confidence: f64,
}

/// Result of greedy bipartite matching.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matched: Vec<WindowMatch>,
    pub unmatched_orphans: Vec<i64>,
    pub unmatched_current: Vec<i64>,
}

/// Greedy bipartite matching between orphan and current windows.
///
/// Computes the full score cross-product, sorts candidates by score descending
/// (ties broken by orphan then current ID for determinism), then accepts pairs
/// at or above [`MATCH_THRESHOLD`] as long as neither side was consumed.
/// No global-optimum assignment: browsers restore windows in roughly original
/// order and ties are rare, so first-seen-wins is sufficient.
#[must_use]
pub fn find_best_matches(orphans: &[WindowTabSet], current: &[WindowTabSet]) -> MatchOutcome {
    struct Candidate {
        score: f64,
        orphan_id: i64,
        current_id: i64,
    }

    let mut candidates = Vec::with_capacity(orphans.len() * current.len());
    for orphan in orphans {
        for cur in current {
            candidates.push(Candidate {
                score: calculate_match_score(&orphan.urls, &cur.urls),
                orphan_id: orphan.window_id,
                current_id: cur.window_id,
            });
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.orphan_id.cmp(&b.orphan_id))
            .then_with(|| a.current_id.cmp(&b.current_id))
    });

    let mut used_orphans: HashSet<i64> = HashSet::new();
    let mut used_current: HashSet<i64> = HashSet::new();
    let mut matched = Vec::new();

    for cand in candidates {
        if cand.score < MATCH_THRESHOLD {
            break;
        }
        if used_orphans.contains(&cand.orphan_id) || used_current.contains(&cand.current_id) {
            continue;
        }
        used_orphans.insert(cand.orphan_id);
        used_current.insert(cand.current_id);
        matched.push(WindowMatch {
            orphan_window_id: cand.orphan_id,
            current_window_id: cand.current_id,
            confidence: cand.score,
        });
    }

    MatchOutcome {
        matched,
        unmatched_orphans: orphans
            .iter()
            .map(|w| w.window_id)
            .filter(|id| !used_orphans.contains(id))
            .collect(),
        unmatched_current: current
            .iter()
            .map(|w| w.window_id)
            .filter(|id| !used_current.contains(id))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn internal_schemes_are_invalid() {
        assert!(!is_valid_url("chrome://settings"));
        assert!(!is_valid_url("chrome-extension://abc/popup.html"));
        assert!(!is_valid_url("about:blank"));
        assert!(!is_valid_url("edge://flags"));
        assert!(!is_valid_url(""));
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://localhost:8080/dev"));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://a.com/x/y?z=1"), Some("a.com"));
        assert_eq!(host_of("http://a.com:8080/x"), Some("a.com"));
        assert_eq!(host_of("https://a.com"), Some("a.com"));
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn host_and_path_strips_query_and_trailing_slash() {
        assert_eq!(
            host_and_path("https://a.com/docs/?q=1").as_deref(),
            Some("a.com/docs")
        );
        assert_eq!(host_and_path("https://a.com").as_deref(), Some("a.com"));
    }

    #[test]
    fn score_identical_sets_is_one() {
        let a = urls(&["https://a.com/x", "https://b.com/y"]);
        let score = calculate_match_score(&a, &a);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_empty_cases() {
        let empty: Vec<String> = vec![];
        let b = urls(&["https://b.com"]);
        assert!((calculate_match_score(&empty, &empty) - 1.0).abs() < f64::EPSILON);
        assert!(calculate_match_score(&empty, &b).abs() < f64::EPSILON);
        assert!(calculate_match_score(&b, &empty).abs() < f64::EPSILON);
    }

    #[test]
    fn internal_only_sets_match_trivially() {
        let a = urls(&["chrome://newtab"]);
        let b = urls(&["about:blank"]);
        assert!((calculate_match_score(&a, &b) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disjoint_sets_score_low() {
        let a = urls(&["https://a.com/1", "https://a.com/2"]);
        let b = urls(&["https://z.org/1", "https://z.org/2"]);
        let score = calculate_match_score(&a, &b);
        // Only count similarity contributes (same sizes).
        assert!((score - WEIGHT_COUNT).abs() < 1e-9);
        assert!(score < MATCH_THRESHOLD);
    }

    #[test]
    fn signature_is_deterministic_and_order_independent() {
        let a = urls(&["https://a.com/1", "https://b.com/2", "https://a.com/3"]);
        let b = urls(&["https://b.com/2", "https://a.com/3", "https://a.com/1"]);
        let sig_a = generate_window_signature(&a);
        let sig_b = generate_window_signature(&b);
        assert_eq!(sig_a, sig_b);
        assert_eq!(sig_a.valid_tab_count, 3);
        assert_eq!(sig_a.top_domains, vec!["a.com".to_string(), "b.com".to_string()]);
    }

    #[test]
    fn signature_ignores_internal_tabs() {
        let a = urls(&["https://a.com/1", "chrome://settings"]);
        let sig = generate_window_signature(&a);
        assert_eq!(sig.valid_tab_count, 1);
        assert_eq!(sig.top_domains, vec!["a.com".to_string()]);
    }

    #[test]
    fn greedy_matching_consumes_each_window_once() {
        let orphans = vec![
            WindowTabSet {
                window_id: 1,
                urls: urls(&["https://a.com/x", "https://b.com/y"]),
            },
            WindowTabSet {
                window_id: 2,
                urls: urls(&["https://a.com/x"]),
            },
        ];
        let current = vec![WindowTabSet {
            window_id: 10,
            urls: urls(&["https://a.com/x", "https://b.com/y"]),
        }];

        let outcome = find_best_matches(&orphans, &current);
        assert_eq!(outcome.matched.len(), 1);
        assert_eq!(outcome.matched[0].orphan_window_id, 1);
        assert_eq!(outcome.matched[0].current_window_id, 10);
        assert_eq!(outcome.unmatched_orphans, vec![2]);
        assert!(outcome.unmatched_current.is_empty());

        let mut orphan_sides: Vec<i64> =
            outcome.matched.iter().map(|m| m.orphan_window_id).collect();
        let mut current_sides: Vec<i64> =
            outcome.matched.iter().map(|m| m.current_window_id).collect();
        orphan_sides.dedup();
        current_sides.dedup();
        assert_eq!(orphan_sides.len(), outcome.matched.len());
        assert_eq!(current_sides.len(), outcome.matched.len());
    }

    #[test]
    fn matches_below_threshold_are_rejected() {
        let orphans = vec![WindowTabSet {
            window_id: 1,
            urls: urls(&["https://a.com/1", "https://a.com/2"]),
        }];
        let current = vec![WindowTabSet {
            window_id: 10,
            urls: urls(&["https://z.org/1", "https://z.org/2"]),
        }];

        let outcome = find_best_matches(&orphans, &current);
        assert!(outcome.matched.is_empty());
        assert_eq!(outcome.unmatched_orphans, vec![1]);
        assert_eq!(outcome.unmatched_current, vec![10]);
    }

    #[test]
    fn accepted_matches_meet_threshold() {
        let orphans = vec![
            WindowTabSet {
                window_id: 1,
                urls: urls(&["https://a.com/x", "https://b.com/y"]),
            },
            WindowTabSet {
                window_id: 2,
                urls: urls(&["https://c.com/z"]),
            },
        ];
        let current = vec![
            WindowTabSet {
                window_id: 10,
                urls: urls(&["https://a.com/x", "https://b.com/other"]),
            },
            WindowTabSet {
                window_id: 11,
                urls: urls(&["https://c.com/z"]),
            },
        ];

        let outcome = find_best_matches(&orphans, &current);
        for m in &outcome.matched {
            assert!(m.confidence >= MATCH_THRESHOLD);
        }
        assert_eq!(outcome.matched.len(), 2);
    }

    proptest! {
        #[test]
        fn score_is_symmetric(
            a in prop::collection::vec("[a-d]{1,3}", 0..6),
            b in prop::collection::vec("[a-d]{1,3}", 0..6),
        ) {
            let a: Vec<String> = a.into_iter().map(|h| format!("https://{h}.com/p")).collect();
            let b: Vec<String> = b.into_iter().map(|h| format!("https://{h}.com/p")).collect();
            let ab = calculate_match_score(&a, &b);
            let ba = calculate_match_score(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-12);
        }

        #[test]
        fn score_is_bounded(
            a in prop::collection::vec("[a-f]{1,4}", 0..8),
            b in prop::collection::vec("[a-f]{1,4}", 0..8),
        ) {
            let a: Vec<String> = a.into_iter().map(|h| format!("https://{h}.io/")).collect();
            let b: Vec<String> = b.into_iter().map(|h| format!("https://{h}.io/")).collect();
            let score = calculate_match_score(&a, &b);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn nonempty_valid_self_score_is_one(
            a in prop::collection::vec("[a-f]{1,4}", 1..8),
        ) {
            let a: Vec<String> = a.into_iter().map(|h| format!("https://{h}.io/x")).collect();
            let score = calculate_match_score(&a, &a);
            prop_assert!((score - 1.0).abs() < 1e-9);
        }
    }
}
