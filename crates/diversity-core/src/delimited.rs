//! Helpers for the delimited text files similarity matrices and counts
//! are stored in.
use std::path::Path;

/// Field delimiter implied by a file's extension: comma for `.csv`, tab
/// for everything else.
pub fn delimiter_for(path: &Path) -> char {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => ',',
        _ => '\t',
    }
}

/// Drop a leading UTF-8 byte-order mark, as written by spreadsheet exports.
pub fn strip_bom(line: &str) -> &str {
    line.strip_prefix('\u{feff}').unwrap_or(line)
}

/// Split a line into trimmed fields, stripping one layer of double quotes.
pub fn split_fields(line: &str, delimiter: char) -> impl Iterator<Item = &str> {
    line.trim_end_matches(['\r', '\n']).split(delimiter).map(|f| {
        let f = f.trim();
        f.strip_prefix('"').and_then(|f| f.strip_suffix('"')).unwrap_or(f)
    })
}
