//! Domain list handling and SNI matching.
//!
//! Lists come from comma-separated flags or v2ray-style files: `#`/`;`
//! comments, `full:`/`domain:` prefixes stripped, `regexp:` entries
//! discarded. Matching is exact-or-suffix (`host == pat` or host ends with
//! `".pat"`), the exclude list wins over the include list, and `all` puts
//! the matcher into match-anything mode.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    include: Vec<String>,
    exclude: Vec<String>,
    all: bool,
}

impl DomainMatcher {
    pub fn new(include: Vec<String>, exclude: Vec<String>, all: bool) -> Self {
        Self {
            include: normalize(include),
            exclude: normalize(exclude),
            all,
        }
    }

    pub fn all_domains(&self) -> bool {
        self.all
    }

    /// Include suffixes, for the brute-mode substring scan.
    pub fn include_list(&self) -> &[String] {
        &self.include
    }

    pub fn is_excluded(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.exclude.iter().any(|p| suffix_match(&host, p))
    }

    /// Exclude beats include; `all` matches any non-excluded host.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if self.exclude.iter().any(|p| suffix_match(&host, p)) {
            return false;
        }
        if self.all {
            return true;
        }
        self.include.iter().any(|p| suffix_match(&host, p))
    }
}

fn suffix_match(host: &str, pat: &str) -> bool {
    host == pat || (host.len() > pat.len() && host.ends_with(pat) && host.as_bytes()[host.len() - pat.len() - 1] == b'.')
}

fn normalize(list: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(list.len());
    for raw in list {
        let s = raw.trim().to_ascii_lowercase();
        if s.is_empty() || out.contains(&s) {
            continue;
        }
        out.push(s);
    }
    out
}

/// Parse one line of a domain list; `None` for comments, blanks and regexps.
fn parse_line(line: &str) -> Option<String> {
    let line = match line.find(['#', ';']) {
        Some(i) => &line[..i],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let lower = line.to_ascii_lowercase();
    let stripped = if let Some(rest) = lower.strip_prefix("full:") {
        rest
    } else if let Some(rest) = lower.strip_prefix("domain:") {
        rest
    } else if lower.starts_with("regexp:") {
        return None;
    } else {
        &lower
    };
    let stripped = stripped.trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Load a domain file into a flat lowercase list.
pub fn load_file(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(text.lines().filter_map(parse_line).collect())
}

/// Split a `--sni-domains a,b,c` style value.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(parse_line)
        .collect()
}

/// Case-insensitive substring scan of `payload` for any include suffix;
/// returns the matched pattern and its byte offset. Brute-mode discovery.
pub fn brute_find(payload: &[u8], domains: &[String]) -> Option<(String, usize)> {
    let lower: Vec<u8> = payload.iter().map(|b| b.to_ascii_lowercase()).collect();
    for dom in domains {
        let needle = dom.as_bytes();
        if needle.is_empty() {
            continue;
        }
        if let Some(off) = lower
            .windows(needle.len())
            .position(|w| w == needle)
        {
            return Some((dom.clone(), off));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_suffix_match() {
        let m = DomainMatcher::new(vec!["example.com".into()], vec![], false);
        assert!(m.matches("example.com"));
        assert!(m.matches("www.example.com"));
        assert!(m.matches("WWW.EXAMPLE.COM"));
        assert!(!m.matches("example.com.evil"));
        assert!(!m.matches("notexample.com"));
        assert!(!m.matches("example.org"));
    }

    #[test]
    fn exclude_wins() {
        let m = DomainMatcher::new(
            vec!["example.com".into()],
            vec!["static.example.com".into()],
            false,
        );
        assert!(m.matches("example.com"));
        assert!(!m.matches("static.example.com"));
        assert!(!m.matches("cdn.static.example.com"));
    }

    #[test]
    fn all_domains_spares_excludes() {
        let m = DomainMatcher::new(vec![], vec!["bank.example".into()], true);
        assert!(m.matches("whatever.net"));
        assert!(!m.matches("bank.example"));
    }

    #[test]
    fn line_grammar() {
        assert_eq!(parse_line("full:Example.COM"), Some("example.com".into()));
        assert_eq!(parse_line("domain: youtube.com "), Some("youtube.com".into()));
        assert_eq!(parse_line("regexp:.*\\.cdn\\..*"), None);
        assert_eq!(parse_line("# comment"), None);
        assert_eq!(parse_line("googlevideo.com ; tail"), Some("googlevideo.com".into()));
        assert_eq!(parse_line("   "), None);
    }

    #[test]
    fn list_parse_dedupes_via_matcher() {
        let m = DomainMatcher::new(parse_list("A.com,b.org,a.com"), vec![], false);
        assert_eq!(m.include_list(), &["a.com".to_string(), "b.org".to_string()]);
    }

    #[test]
    fn file_loading_follows_v2ray_grammar() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# blocked video hosts").unwrap();
        writeln!(f, "full:Youtube.COM").unwrap();
        writeln!(f, "domain:googlevideo.com ; cdn").unwrap();
        writeln!(f, "regexp:^ads[0-9]+\\.").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "ytimg.com").unwrap();
        let list = load_file(f.path()).unwrap();
        assert_eq!(list, vec!["youtube.com", "googlevideo.com", "ytimg.com"]);
        assert!(load_file(std::path::Path::new("/nonexistent/list")).is_err());
    }

    #[test]
    fn brute_scan_is_case_insensitive() {
        let payload = b"\x16\x03\x01..GoogleVideo.COM..";
        let (dom, off) = brute_find(payload, &["googlevideo.com".into()]).unwrap();
        assert_eq!(dom, "googlevideo.com");
        assert_eq!(off, 5);
        assert!(brute_find(payload, &["netflix.com".into()]).is_none());
    }
}
