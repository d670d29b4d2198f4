//! Class-label maps and stable label coloring.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};

/// Read a label file into an id → name map.
///
/// Two formats are accepted, decided per line: `<id><whitespace><label>`, or
/// a bare label whose id is the zero-based line number. Blank lines and
/// `#` comments are skipped without consuming an id.
pub fn load_labels<P: AsRef<Path>>(path: P) -> Result<BTreeMap<i32, String>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read label file {}", path.display()))?;

    let mut map = BTreeMap::new();
    let mut implicit_id = 0i32;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let numbered = line
            .split_once(char::is_whitespace)
            .and_then(|(first, rest)| Some((first.parse::<i32>().ok()?, rest.trim())));
        match numbered {
            Some((id, name)) => {
                map.insert(id, name.to_string());
            }
            None => {
                map.insert(implicit_id, line.to_string());
            }
        }
        implicit_id += 1;
    }
    Ok(map)
}

/// Label for an id, falling back to the decimal id when unmapped.
pub fn get_label(labels: &BTreeMap<i32, String>, id: i32) -> String {
    labels
        .get(&id)
        .cloned()
        .unwrap_or_else(|| id.to_string())
}

/// Stable RGBA color for a label string.
///
/// A pure function of the label (FNV-1a over its bytes), so equal labels
/// always render the same color across frames and runs. The low bits of each
/// channel are lifted so colors stay visible on dark video. Alpha is caller
/// controlled.
pub fn label_color(label: &str, alpha: u8) -> [u8; 4] {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in label.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let r = ((hash >> 16) as u8) | 0x40;
    let g = ((hash >> 8) as u8) | 0x40;
    let b = (hash as u8) | 0x40;
    [r, g, b, alpha]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_labels(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(contents.as_bytes()).expect("write labels");
        file
    }

    #[test]
    fn loads_plain_label_lines() {
        let file = write_labels("person\nbicycle\ncar\n");
        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels.get(&0).map(String::as_str), Some("person"));
        assert_eq!(labels.get(&2).map(String::as_str), Some("car"));
    }

    #[test]
    fn loads_numbered_label_lines() {
        let file = write_labels("0  background\n15 person\n127 dog\n");
        let labels = load_labels(file.path()).unwrap();
        assert_eq!(labels.get(&15).map(String::as_str), Some("person"));
        assert_eq!(labels.get(&127).map(String::as_str), Some("dog"));
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn missing_ids_render_as_decimal() {
        let labels = BTreeMap::new();
        assert_eq!(get_label(&labels, 42), "42");
    }

    #[test]
    fn label_color_is_pure_in_the_string() {
        let a = label_color("person", 64);
        let b = label_color("person", 64);
        assert_eq!(a, b);

        let c = label_color("person", 255);
        assert_eq!(&a[..3], &c[..3], "alpha must not affect rgb");
        assert_eq!(c[3], 255);

        let d = label_color("dog", 64);
        assert_ne!(&a[..3], &d[..3]);
    }
}
