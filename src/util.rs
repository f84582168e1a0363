//! Date, path and protocol helpers

use chrono::{NaiveDateTime, TimeZone, Utc};

/// RFC 7231 IMF-fixdate, e.g. `Sat, 27 Sep 2014 06:31:15 GMT`.
const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats unix seconds as an RFC 7231 date string.
pub fn http_date(secs: i64) -> String {
    match Utc.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format(IMF_FIXDATE).to_string(),
        None => Utc.timestamp_opt(0, 0).unwrap().format(IMF_FIXDATE).to_string(),
    }
}

/// Parses an RFC 7231 date into unix seconds. Returns `None` for anything
/// that is not a well-formed IMF-fixdate.
pub fn parse_http_date(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s, IMF_FIXDATE)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

#[inline]
fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%XX` escapes. Malformed escapes are copied through untouched;
/// `+` is left alone (it is a literal in paths).
pub fn percent_decode(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_val),
                bytes.get(i + 2).copied().and_then(hex_val),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encodes everything outside the unreserved set. `/` is escaped,
/// `+` is not, so decode-then-encode round-trips request paths.
pub fn percent_encode(src: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(src.len());
    for &b in src.as_bytes() {
        let unreserved = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'+');
        if unreserved {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xf) as usize] as char);
        }
    }
    out
}

/// `h2` is required over ALPN; the `h2-14`/`h2-16` draft aliases are
/// accepted for compatibility.
pub fn h2_is_selected(proto: &[u8]) -> bool {
    proto == b"h2" || proto == b"h2-14" || proto == b"h2-16"
}

#[cfg(test)]
mod test {
    use super::{h2_is_selected, http_date, parse_http_date, percent_decode, percent_encode};

    #[test]
    fn http_date_round_trips_well_formed_dates() {
        let s = "Sat, 27 Sep 2014 06:31:15 GMT";
        assert_eq!(s, http_date(parse_http_date(s).unwrap()));
    }

    #[test]
    fn parse_http_date_rejects_garbage() {
        assert_eq!(None, parse_http_date("yesterday-ish"));
        assert_eq!(None, parse_http_date("Sat, 27 Sep 2014 06:31:15"));
    }

    #[test]
    fn percent_decode_then_encode_preserves_original_bytes() {
        let original = "%20+%2F";
        let decoded = percent_decode(original);
        assert_eq!(" +/", decoded);
        assert_eq!(original, percent_encode(&decoded));
    }

    #[test]
    fn percent_decode_copies_malformed_escapes() {
        assert_eq!("100%", percent_decode("100%"));
        assert_eq!("%zz", percent_decode("%zz"));
    }

    #[test]
    fn h2_alias_check_accepts_draft_names_only() {
        assert!(h2_is_selected(b"h2"));
        assert!(h2_is_selected(b"h2-14"));
        assert!(h2_is_selected(b"h2-16"));
        assert!(!h2_is_selected(b"http/1.1"));
    }
}
