//! Date-bucket resolution for classroom photos.
//!
//! The canonical bucket name is `YYYY-MM-DD`. Loose photos may carry a
//! date in their parent folder name or basename in a few tolerated
//! spellings; anything else resolves to "today".

use chrono::{Datelike, Local, NaiveDate};
use std::path::Path;

/// Today's local calendar day in canonical form, fixed at run start.
pub fn today_bucket() -> String {
    let now = Local::now();
    format!("{:04}-{:02}-{:02}", now.year(), now.month(), now.day())
}

/// True iff `name` is a canonical date-bucket directory name.
pub fn is_canonical_bucket(name: &str) -> bool {
    parse_canonical(name).is_some()
}

fn parse_canonical(name: &str) -> Option<NaiveDate> {
    let bytes = name.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    parse_ymd(&name[0..4], &name[5..7], &name[8..10])
}

/// Parse one of the accepted date spellings into a canonical bucket name.
///
/// Accepted: `YYYY-MM-DD`, `YYYY_MM_DD`, `YYYY.MM.DD`, `YYYYMMDD`.
/// Each must be a real calendar date; month/day/year orders are refused
/// to avoid regional ambiguity.
pub fn parse_date_token(text: &str) -> Option<String> {
    let s = text.trim();
    if !s.is_ascii() {
        return None;
    }
    let bytes = s.as_bytes();

    let date = match bytes.len() {
        10 => {
            let sep = bytes[4];
            if (sep == b'-' || sep == b'_' || sep == b'.') && bytes[7] == sep {
                parse_ymd(&s[0..4], &s[5..7], &s[8..10])
            } else {
                None
            }
        }
        8 => parse_ymd(&s[0..4], &s[4..6], &s[6..8]),
        _ => None,
    }?;

    Some(format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month(),
        date.day()
    ))
}

fn parse_ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
    let year: i32 = y.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    let day: u32 = d.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Resolve the date bucket for one photo.
///
/// Order: canonical parent directory name, then any accepted spelling in
/// the parent name, then any accepted spelling in the file stem, then
/// `today` (the run's local day).
pub fn resolve_bucket(path: &Path, today: &str) -> String {
    if let Some(parent) = path.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
        if is_canonical_bucket(parent) {
            return parent.to_string();
        }
        if let Some(date) = parse_date_token(parent) {
            return date;
        }
    }
    if let Some(stem) = path.file_stem().and_then(|n| n.to_str()) {
        if let Some(date) = find_date_in_text(stem) {
            return date;
        }
    }
    today.to_string()
}

/// Scan a basename for an embedded date token.
///
/// Tries the whole stem first, then windows of the separator-delimited
/// lengths (10 and 8 chars) so names like `party_2026-01-02_cam1` work.
fn find_date_in_text(text: &str) -> Option<String> {
    if let Some(date) = parse_date_token(text) {
        return Some(date);
    }
    for window in [10usize, 8] {
        if text.len() < window {
            continue;
        }
        for start in 0..=(text.len() - window) {
            let Some(slice) = text.get(start..start + window) else {
                continue;
            };
            if let Some(date) = parse_date_token(slice) {
                return Some(date);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_canonical_bucket() {
        assert!(is_canonical_bucket("2026-01-02"));
        assert!(is_canonical_bucket("1999-12-31"));
        assert!(!is_canonical_bucket("2026-13-02"));
        assert!(!is_canonical_bucket("2026-02-30"));
        assert!(!is_canonical_bucket("2026_01_02"));
        assert!(!is_canonical_bucket("26-01-02"));
    }

    #[test]
    fn test_parse_date_token_spellings() {
        assert_eq!(parse_date_token("2026-01-02").as_deref(), Some("2026-01-02"));
        assert_eq!(parse_date_token("2026_01_02").as_deref(), Some("2026-01-02"));
        assert_eq!(parse_date_token("2026.01.02").as_deref(), Some("2026-01-02"));
        assert_eq!(parse_date_token("20260102").as_deref(), Some("2026-01-02"));
    }

    #[test]
    fn test_parse_date_token_rejects() {
        // Mixed separators, impossible dates, regional orders.
        assert_eq!(parse_date_token("2026-01_02"), None);
        assert_eq!(parse_date_token("20261302"), None);
        assert_eq!(parse_date_token("01-02-2026"), None);
        assert_eq!(parse_date_token("Jan 2 2026"), None);
        assert_eq!(parse_date_token(""), None);
    }

    #[test]
    fn test_resolve_bucket_canonical_parent_wins() {
        let path = PathBuf::from("class_photos/2026-01-02/party_20991231.jpg");
        assert_eq!(resolve_bucket(&path, "2026-07-01"), "2026-01-02");
    }

    #[test]
    fn test_resolve_bucket_alternate_parent() {
        let path = PathBuf::from("class_photos/2026_01_02/p.jpg");
        assert_eq!(resolve_bucket(&path, "2026-07-01"), "2026-01-02");
    }

    #[test]
    fn test_resolve_bucket_from_basename() {
        let path = PathBuf::from("class_photos/IMG_20260102_cam1.jpg");
        assert_eq!(resolve_bucket(&path, "2026-07-01"), "2026-01-02");

        let dotted = PathBuf::from("class_photos/trip_2026.01.02.png");
        assert_eq!(resolve_bucket(&dotted, "2026-07-01"), "2026-01-02");
    }

    #[test]
    fn test_resolve_bucket_falls_back_to_today() {
        let path = PathBuf::from("class_photos/IMG_4411.jpg");
        assert_eq!(resolve_bucket(&path, "2026-07-01"), "2026-07-01");
    }

    #[test]
    fn test_today_bucket_is_canonical() {
        assert!(is_canonical_bucket(&today_bucket()));
    }
}
