//! Line-oriented INI reader.
//!
//! Deliberately permissive, like the format it replaces: unknown content is
//! reported with a line number by the caller rather than aborting the parse.

#[derive(Debug, Default, Clone)]
pub struct Entry {
    pub key: String,
    pub val: Option<String>,
    pub lnum: usize,
}

#[derive(Debug, Default, Clone)]
pub struct Section {
    pub name: String,
    pub entries: Vec<Entry>,
    pub lnum: usize,
}

/// Splits a `key = value` line. The value may contain `=`; as special cases
/// the key itself may be `=` or start with the `**=` wildcard spelling.
pub fn parse_kvp(line: &str) -> (&str, Option<&str>) {
    let skip = if line.starts_with('=') {
        1
    } else if line.starts_with("**=") {
        3
    } else {
        0
    };

    match line[skip..].find('=') {
        Some(pos) => {
            let key = line[..skip + pos].trim_end_matches([' ', '\t']);
            let val = line[skip + pos + 1..].trim_start_matches([' ', '\t']);
            (key, Some(val))
        }
        None => (line, None),
    }
}

/// Checksum over the content lines a parse pass actually sees, used to
/// detect the file changing between passes.
fn checksum(sum: &mut u32, line: &str) {
    for b in line.bytes() {
        *sum = sum.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    *sum = sum.wrapping_mul(33).wrapping_add(u32::from(b'\n'));
}

/// Parses `s` into sections. Returns the sections and the content checksum;
/// an empty section list means no section header was ever seen.
pub fn parse(s: &str) -> (Vec<Section>, u32) {
    let mut sections: Vec<Section> = Vec::new();
    let mut sum = 5381u32;

    for (lnum, line) in s.lines().enumerate() {
        let lnum = lnum + 1;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        checksum(&mut sum, line);

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push(Section {
                name: name.to_owned(),
                entries: Vec::new(),
                lnum,
            });
            continue;
        }

        let Some(section) = sections.last_mut() else {
            continue;
        };

        let (key, val) = parse_kvp(line);
        section.entries.push(Entry {
            key: key.to_owned(),
            val: val.map(str::to_owned),
            lnum,
        });
    }

    (sections, sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kvp() {
        assert_eq!(parse_kvp("a = b"), ("a", Some("b")));
        assert_eq!(parse_kvp("a=b = c"), ("a", Some("b = c")));
        assert_eq!(parse_kvp("= = x"), ("=", Some("x")));
        assert_eq!(parse_kvp("**= = x"), ("**=", Some("x")));
        assert_eq!(parse_kvp("bare"), ("bare", None));
    }

    #[test]
    fn sections_and_lines() {
        let (sections, _) = parse("# comment\n[main]\na = b\n\n[other]\nc = d\ne\n");

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].name, "main");
        assert_eq!(sections[0].entries.len(), 1);
        assert_eq!(sections[0].entries[0].key, "a");
        assert_eq!(sections[0].entries[0].val.as_deref(), Some("b"));
        assert_eq!(sections[0].entries[0].lnum, 3);
        assert_eq!(sections[1].entries[1].key, "e");
        assert_eq!(sections[1].entries[1].val, None);
    }

    #[test]
    fn content_outside_sections_is_dropped() {
        let (sections, _) = parse("stray = 1\n");
        assert!(sections.is_empty());
    }

    #[test]
    fn checksum_tracks_content() {
        let (_, a) = parse("[x]\na = b\n");
        let (_, b) = parse("[x]\na = b\n# comment ignored\n");
        let (_, c) = parse("[x]\na = c\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
