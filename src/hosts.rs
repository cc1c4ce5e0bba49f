//! Host list parsing with shell-style bracket expansion.
//!
//! `sfa[1-3][a,b]` expands to `sfa1a sfa1b sfa2a sfa2b sfa3a sfa3b`.
//! A bracket holds either a comma-separated item list or an inclusive
//! numeric range `start-end` with `end > start`. Brackets do not nest.

use crate::error::{Error, Result};

/// Parse a configured host list into individual host names.
pub fn parse_host_list(list: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for part in bracket_aware_split(list) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        hosts.extend(expand(part)?);
    }
    Ok(hosts)
}

/// Split on commas that are not inside a bracket expression.
pub fn bracket_aware_split(list: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;

    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&list[start..]);
    out
}

/// Expand every bracket expression in `item`, leftmost bracket varying
/// slowest.
pub fn expand(item: &str) -> Result<Vec<String>> {
    let Some(open) = item.find('[') else {
        return Ok(vec![item.to_string()]);
    };
    let close = item[open..]
        .find(']')
        .map(|offset| open + offset)
        .ok_or_else(|| grammar(item, "unterminated bracket"))?;

    let prefix = &item[..open];
    let body = &item[open + 1..close];
    let rest = expand(&item[close + 1..])?;

    if body.contains('[') {
        return Err(grammar(item, "nested brackets are not supported"));
    }

    let tokens: Vec<String> = if body.contains(',') {
        body.split(',').map(str::to_string).collect()
    } else {
        let (first, last) = body
            .split_once('-')
            .ok_or_else(|| grammar(item, "range must be two numbers separated by a dash"))?;
        let first: u64 = first
            .trim()
            .parse()
            .map_err(|_| grammar(item, "range start is not a number"))?;
        let last: u64 = last
            .trim()
            .parse()
            .map_err(|_| grammar(item, "range end is not a number"))?;
        if last <= first {
            return Err(grammar(item, "range end must be greater than its start"));
        }
        (first..=last).map(|n| n.to_string()).collect()
    };

    let mut out = Vec::with_capacity(tokens.len() * rest.len());
    for token in &tokens {
        for suffix in &rest {
            out.push(format!("{prefix}{token}{suffix}"));
        }
    }
    Ok(out)
}

fn grammar(item: &str, reason: &str) -> Error {
    Error::Config(format!("bad host expression '{item}': {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(
            parse_host_list("alpha, beta ,gamma").unwrap(),
            vec!["alpha", "beta", "gamma"]
        );
    }

    #[test]
    fn numeric_range() {
        assert_eq!(
            expand("sfa[1-3]").unwrap(),
            vec!["sfa1", "sfa2", "sfa3"]
        );
    }

    #[test]
    fn item_list_with_empty_token() {
        assert_eq!(
            expand("quark:[,anti-]up").unwrap(),
            vec!["quark:up", "quark:anti-up"]
        );
    }

    #[test]
    fn multiple_brackets_multiply() {
        assert_eq!(
            expand("sfa[1-2][a,b]-ctl").unwrap(),
            vec!["sfa1a-ctl", "sfa1b-ctl", "sfa2a-ctl", "sfa2b-ctl"]
        );
    }

    #[test]
    fn split_ignores_commas_inside_brackets() {
        assert_eq!(
            bracket_aware_split("a,b[1,2],c"),
            vec!["a", "b[1,2]", "c"]
        );
        assert_eq!(
            parse_host_list("ddn[1-2],other[x,y]").unwrap(),
            vec!["ddn1", "ddn2", "otherx", "othery"]
        );
    }

    #[test]
    fn malformed_expressions_fail() {
        assert!(expand("sfa[3-1]").is_err());
        assert!(expand("sfa[1-2-3]").is_err());
        assert!(expand("sfa[a-b]").is_err());
        assert!(expand("sfa[1-3").is_err());
        assert!(expand("sfa[4]").is_err());
    }
}
