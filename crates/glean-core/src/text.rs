//! Text normalization helpers shared by the pattern and transaction stores

/// Collapse runs of whitespace to single spaces and trim the ends.
///
/// Case is preserved; canonical rows keep the original casing of the
/// statement description.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Uppercase alphanumeric tokens of a description, in order.
///
/// This is the unit of the inverted indexes: pattern candidate lookup and
/// transaction similarity both operate on these tokens.
pub fn tokenize(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_uppercase())
        .collect()
}

/// Tokens with digits dropped and duplicates removed, order preserved.
///
/// Used when generalizing corrected descriptions into candidate patterns:
/// store numbers and invoice counters are noise, words are signal.
pub fn signal_tokens(s: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(s)
        .into_iter()
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Normalize an account identifier or wallet address for lookup.
///
/// Wallet addresses compare case-insensitively and bank identifiers often
/// arrive with stray whitespace.
pub fn normalize_identifier(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Jaccard similarity of the token sets of two descriptions.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let sa: HashSet<String> = tokenize(a).into_iter().collect();
    let sb: HashSet<String> = tokenize(b).into_iter().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    inter as f64 / union as f64
}

/// Longest common ordered token subsequence across a set of descriptions.
///
/// Deterministic pattern extraction for the reinforcement engine: lowercase,
/// digits dropped, whitespace collapsed, then the longest token run shared by
/// every sample in order.
pub fn common_token_sequence(descriptions: &[&str]) -> Vec<String> {
    let mut iter = descriptions.iter();
    let first = match iter.next() {
        Some(d) => signal_tokens(d),
        None => return Vec::new(),
    };
    let mut common = first;
    for desc in iter {
        let tokens = signal_tokens(desc);
        common = lcs(&common, &tokens);
        if common.is_empty() {
            break;
        }
    }
    common
}

/// Classic DP longest common subsequence over token slices.
fn lcs(a: &[String], b: &[String]) -> Vec<String> {
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return Vec::new();
    }
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in 1..=n {
        for j in 1..=m {
            table[i][j] = if a[i - 1] == b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    let mut out = Vec::with_capacity(table[n][m]);
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        if a[i - 1] == b[j - 1] {
            out.push(a[i - 1].clone());
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    out.reverse();
    out
}
