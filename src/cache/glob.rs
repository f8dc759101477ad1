//! Redis-compatible glob matching for the in-process backend.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes with the
//! same semantics as `SCAN ... MATCH`.

pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    matches_from(&pattern, &key)
}

fn matches_from(pattern: &[char], key: &[char]) -> bool {
    let (mut p, mut k) = (0, 0);
    // Position to resume from after the most recent `*`.
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    while p < pattern.len() && pattern[p] == '*' {
                        p += 1;
                    }
                    if p == pattern.len() {
                        return true;
                    }
                    backtrack = Some((p, k));
                    continue;
                }
                '?' => {
                    p += 1;
                    k += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(pattern, p, key[k])
                        && matched
                    {
                        p = next;
                        k += 1;
                        continue;
                    }
                }
                '\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == key[k] {
                        p += 2;
                        k += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == key[k] {
                        p += 1;
                        k += 1;
                        continue;
                    }
                }
            }
        }

        match backtrack {
            Some((star_p, star_k)) => {
                backtrack = Some((star_p, star_k + 1));
                p = star_p;
                k = star_k + 1;
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}

/// Match `ch` against the class opening at `start`.
///
/// Returns whether it matched and the index after the closing `]`, or
/// `None` when the class is unterminated (treated as a mismatch).
fn match_class(pattern: &[char], start: usize, ch: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < pattern.len() && pattern[i] != ']' {
        let mut low = pattern[i];
        if low == '\\' && i + 1 < pattern.len() {
            i += 1;
            low = pattern[i];
        }
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            let high = pattern[i + 2];
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            if (low..=high).contains(&ch) {
                matched = true;
            }
            i += 3;
        } else {
            if low == ch {
                matched = true;
            }
            i += 1;
        }
    }

    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
