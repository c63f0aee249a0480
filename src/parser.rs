//! Component H: tokenises a `G<key>=<value>(,...)*(;<payload>)?` command
//! string into a typed-but-generic [`Command`] record.
//!
//! Per §4.H this stays deliberately thin: it extracts every key's raw value
//! without trying to resolve which of the several meanings a polysemous key
//! (`c=`, `r=`, `s=`, `v=`, `x=`, `y=`, `z=`, `X=`, `Y=`) has for this
//! command — that depends on the action, which the dispatcher already has
//! to inspect anyway. The one disambiguation the parser itself needs is
//! `a=`/`i=`/`I=`, extracted in a first pass, because nothing downstream of
//! parsing depends on those three.

use std::collections::HashMap;

/// Maximum key/value pairs accepted per command (§4.H).
const MAX_PAIRS: usize = 32;

/// Keys whose value is a single character rather than a decimal integer.
const CHAR_VALUED_KEYS: [char; 4] = ['a', 't', 'd', 'o'];

const KNOWN_KEYS: [char; 24] = [
    'a', 't', 'd', 'o', 'i', 'I', 'p', 'q', 'm', 'S', 'f', 's', 'v', 'c', 'r', 'x', 'y', 'z', 'X', 'Y', 'U', 'C', 'w',
    'h',
];

#[derive(Debug, Clone, Default)]
pub struct Command {
    /// `a=`; absent means "direct transmission continuation or default `t`".
    pub action: Option<char>,
    pub image_id: u32,
    pub image_number: u32,
    pub placement_id: u32,
    /// All other keys' values, keyed by letter. Decimal keys parse to their
    /// integer value; the four char-valued keys (`t`,`d`,`o`, and `a` itself,
    /// duplicated here for uniform lookup) store their ASCII code point.
    pub raw: HashMap<char, i64>,
    /// Base64 payload after the first unescaped `;`, empty if none.
    pub payload: String,
    /// Keys that failed to parse (unknown key, or a non-decimal value where
    /// one was required). Reported as one `EINVAL` per offending key, but
    /// parsing continues past them (§4.H, §7 propagation policy).
    pub errors: Vec<char>,
}

impl Command {
    pub fn get(&self, key: char) -> Option<i64> {
        self.raw.get(&key).copied()
    }

    pub fn get_char(&self, key: char) -> Option<char> {
        self.get(key).and_then(|v| u8::try_from(v).ok()).map(|b| b as char)
    }

    pub fn get_or(&self, key: char, default: i64) -> i64 {
        self.get(key).unwrap_or(default)
    }
}

/// Parses a command string, which is expected to start with `G` (the escape
/// envelope itself is the host's concern, stripped before this is called).
pub fn parse(raw: &str) -> Command {
    let body = raw.strip_prefix('G').unwrap_or(raw);
    let (header, payload) = match body.split_once(';') {
        Some((h, p)) => (h, p),
        None => (body, ""),
    };

    let mut cmd = Command {
        payload: payload.to_string(),
        ..Command::default()
    };

    let pairs: Vec<&str> = header.split(',').filter(|s| !s.is_empty()).take(MAX_PAIRS).collect();

    for pair in &pairs {
        let Some((key_str, _)) = pair.split_once('=') else {
            continue;
        };
        let Some(key) = key_str.chars().next() else {
            continue;
        };
        if key == 'a' || key == 'i' || key == 'I' {
            if let Some((_, value)) = pair.split_once('=') {
                match key {
                    'a' => cmd.action = value.chars().next(),
                    'i' => cmd.image_id = value.parse().unwrap_or(0),
                    'I' => cmd.image_number = value.parse().unwrap_or(0),
                    _ => unreachable!(),
                }
            }
        }
    }

    for pair in &pairs {
        let Some((key_str, value)) = pair.split_once('=') else {
            continue;
        };
        let Some(key) = key_str.chars().next() else {
            continue;
        };
        if key_str.chars().count() != 1 || !KNOWN_KEYS.contains(&key) {
            cmd.errors.push(key);
            continue;
        }
        if matches!(key, 'a' | 'i' | 'I') {
            // Already handled in the first pass.
            continue;
        }

        if key == 'p' {
            cmd.placement_id = value.parse().unwrap_or(0);
            continue;
        }

        if CHAR_VALUED_KEYS.contains(&key) {
            match value.chars().next() {
                Some(c) => {
                    cmd.raw.insert(key, c as i64);
                }
                None => cmd.errors.push(key),
            }
            continue;
        }

        match value.parse::<i64>() {
            Ok(n) => {
                cmd.raw.insert(key, n);
            }
            Err(_) => cmd.errors.push(key),
        }
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_upload_header() {
        let cmd = parse("Gi=1,f=24,s=2,v=2,t=d,m=1;AAAA");
        assert_eq!(cmd.image_id, 1);
        assert_eq!(cmd.get('f'), Some(24));
        assert_eq!(cmd.get('s'), Some(2));
        assert_eq!(cmd.get('v'), Some(2));
        assert_eq!(cmd.get_char('t'), Some('d'));
        assert_eq!(cmd.get('m'), Some(1));
        assert_eq!(cmd.payload, "AAAA");
        assert!(cmd.errors.is_empty());
    }

    #[test]
    fn unknown_key_is_reported_but_parsing_continues() {
        let cmd = parse("Gi=1,zz=9,f=24");
        assert_eq!(cmd.image_id, 1);
        assert_eq!(cmd.errors, vec!['z']);
        assert_eq!(cmd.get('f'), Some(24));
    }

    #[test]
    fn action_and_placement_id_extracted_first_pass() {
        let cmd = parse("Ga=T,i=7,p=9,c=3,r=2,t=d,m=1;AA");
        assert_eq!(cmd.action, Some('T'));
        assert_eq!(cmd.image_id, 7);
        assert_eq!(cmd.placement_id, 9);
        assert_eq!(cmd.get('c'), Some(3));
        assert_eq!(cmd.get('r'), Some(2));
    }

    #[test]
    fn max_32_pairs_truncates_the_rest() {
        let header: String = (0..40).map(|i| format!("i={i}")).collect::<Vec<_>>().join(",");
        let cmd = parse(&format!("G{header}"));
        // Only the last `i=` pair within the first 32 takes effect.
        assert_eq!(cmd.image_id, 31);
    }

    #[test]
    fn no_payload_is_empty_string() {
        let cmd = parse("Ga=d,d=A");
        assert_eq!(cmd.payload, "");
        assert_eq!(cmd.get_char('d'), Some('A'));
    }

    #[test]
    fn query_mode_keys_parse() {
        let cmd = parse("Ga=q,i=42,f=32,s=1,v=1,t=d,m=1;AAAA");
        assert_eq!(cmd.action, Some('q'));
        assert_eq!(cmd.image_id, 42);
        assert_eq!(cmd.get('f'), Some(32));
    }
}
