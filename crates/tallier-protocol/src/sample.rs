/// Wire format for stat datagrams.
///
/// One datagram carries one or more newline-separated lines of the form
/// `key:value|type[@rate]`, with additional `:value|type[@rate]` parts
/// allowed after the first. A line may instead start with `^hh` (two hex
/// digits): the first `hh` characters of the previously decoded line in
/// the same datagram are prepended to the rest of the line before
/// decoding. Malformed lines and parts are dropped without error.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Counter,
    Timer,
}

/// One decoded measurement: key, value, kind, and client sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub key: String,
    pub value: f64,
    pub kind: SampleKind,
    pub sample_rate: f64,
}

impl Sample {
    /// Parses a datagram into a list of samples. Pure; never fails —
    /// anything unparseable simply yields fewer samples.
    pub fn parse(datagram: &[u8]) -> Vec<Sample> {
        let text = String::from_utf8_lossy(datagram);
        let mut samples = Vec::new();
        let mut previous = String::new();

        for line in text.lines() {
            let metric = if line.len() > 2 && line.starts_with('^') {
                // Prefix compression: ^hh + suffix. A bad header drops
                // the line and leaves `previous` untouched.
                let prefix_len = match line
                    .get(1..3)
                    .and_then(|h| usize::from_str_radix(h, 16).ok())
                {
                    Some(n) => n,
                    None => continue,
                };
                let mut expanded: String = previous.chars().take(prefix_len).collect();
                expanded.push_str(&line[3..]);
                expanded
            } else {
                line.to_string()
            };
            previous = metric.clone();

            let mut fields = metric.split(':');
            let key = normalize_key(fields.next().unwrap_or(""));
            for part in fields {
                if let Some(sample) = parse_part(&key, part) {
                    samples.push(sample);
                }
            }
        }
        samples
    }
}

/// Collapses whitespace runs to `_`, turns backslashes into `-`, then
/// strips everything outside `[A-Za-z0-9._-]`. The substitutions run
/// first so their replacement characters survive the filter.
pub fn normalize_key(key: &str) -> String {
    key.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .replace('\\', "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

// part format: <value> '|' <type> ('@' <rate>)?
fn parse_part(key: &str, part: &str) -> Option<Sample> {
    let fields: Vec<&str> = part.split('|').collect();
    if fields.len() != 2 {
        return None;
    }
    let value: f64 = fields[0].parse().ok()?;
    let (kind_field, sample_rate) = match fields[1].split_once('@') {
        Some((kind_field, rate)) => {
            let rate: f64 = rate.parse().ok()?;
            if !(rate > 0.0 && rate <= 1.0) {
                return None;
            }
            (kind_field, rate)
        }
        None => (fields[1], 1.0),
    };
    let kind = if kind_field == "ms" {
        SampleKind::Timer
    } else {
        SampleKind::Counter
    };
    Some(Sample {
        key: key.to_string(),
        value,
        kind,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_counter() {
        let samples = Sample::parse(b"x:3|c");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].key, "x");
        assert_eq!(samples[0].value, 3.0);
        assert_eq!(samples[0].kind, SampleKind::Counter);
        assert_eq!(samples[0].sample_rate, 1.0);
    }

    #[test]
    fn test_timer_kind() {
        let samples = Sample::parse(b"req.time:12.5|ms");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, SampleKind::Timer);
        assert_eq!(samples[0].value, 12.5);
    }

    #[test]
    fn test_unknown_type_is_counter() {
        let samples = Sample::parse(b"x:1|g");
        assert_eq!(samples[0].kind, SampleKind::Counter);
    }

    #[test]
    fn test_sample_rate() {
        let samples = Sample::parse(b"y:2|c@0.5");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].sample_rate, 0.5);
    }

    #[test]
    fn test_rate_bounds() {
        assert!(Sample::parse(b"k:1|c@0.0").is_empty());
        assert!(Sample::parse(b"k:1|c@-0.5").is_empty());
        assert!(Sample::parse(b"k:1|c@1.5").is_empty());
        assert_eq!(Sample::parse(b"k:1|c@1.0")[0].sample_rate, 1.0);
    }

    #[test]
    fn test_multiple_parts_share_key() {
        let samples = Sample::parse(b"k:1|c:2|ms:3|c@0.1");
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.key == "k"));
        assert_eq!(samples[1].kind, SampleKind::Timer);
        assert_eq!(samples[2].sample_rate, 0.1);
    }

    #[test]
    fn test_key_normalization() {
        let samples = Sample::parse(b"a b\\c:1|c");
        assert_eq!(samples[0].key, "a_b-c");
        assert_eq!(normalize_key("  spaced \t out  "), "spaced_out");
        assert_eq!(normalize_key("a$b%c!"), "abc");
        assert_eq!(normalize_key("ok.key_1-2"), "ok.key_1-2");
    }

    #[test]
    fn test_empty_key_allowed() {
        let samples = Sample::parse(b":1|c");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].key, "");
    }

    #[test]
    fn test_line_without_parts_yields_nothing() {
        assert!(Sample::parse(b"justakey").is_empty());
        assert!(Sample::parse(b"").is_empty());
    }

    #[test]
    fn test_malformed_parts_dropped() {
        let samples = Sample::parse(b"a:1|c\nb:notanumber|c\nc:3|c@2.0\nd:4|c");
        let keys: Vec<&str> = samples.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "d"]);
    }

    #[test]
    fn test_extra_pipe_fields_dropped() {
        assert!(Sample::parse(b"k:1|c|x").is_empty());
        assert!(Sample::parse(b"k:1").is_empty());
    }

    #[test]
    fn test_prefix_compression() {
        let samples = Sample::parse(b"long.key.name:1|c\n^08other:2|c");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].key, "long.key.name");
        assert_eq!(samples[1].key, "long.keyother");
        assert_eq!(samples[1].value, 2.0);
    }

    #[test]
    fn test_prefix_compression_chains() {
        // The second effective line becomes the prefix source for the third.
        let samples = Sample::parse(b"aaaa:1|c\n^04bbbb:2|c\n^08cc:3|c");
        assert_eq!(samples[1].key, "aaaabbbb");
        assert_eq!(samples[2].key, "aaaabbbbcc");
    }

    #[test]
    fn test_prefix_compression_without_previous() {
        let samples = Sample::parse(b"^05abc:1|c");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].key, "abc");
    }

    #[test]
    fn test_bad_compression_header_skips_line_only() {
        let samples = Sample::parse(b"abcdef:1|c\n^zzjunk:9|c\n^06x:2|c");
        let keys: Vec<&str> = samples.iter().map(|s| s.key.as_str()).collect();
        // The bad header line is dropped and does not disturb `previous`.
        assert_eq!(keys, vec!["abcdef", "abcdefx"]);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let datagram = b"a:1|c\n^03b:2|ms@0.5\nnoise\nx y:3|c";
        assert_eq!(Sample::parse(datagram), Sample::parse(datagram));
    }
}
