//! Minimal strict INI reader.
//!
//! Grounded on `squid_dedup/lib/configfile.py`'s `ConfigFile`: section and
//! option names keep their original case, duplicate sections/options within
//! a single file are parse errors (not last-wins), and multi-line values are
//! supported via indented continuation lines, which is how a `match` option
//! carries a newline-separated list of regex sources in one INI value.
//!
//! No crate in the retrieval pack offers this exact dialect, so it is
//! hand-rolled the way the teacher hand-rolls its own line protocols
//! (see `system/protocol/parsing.rs` in the original router-core source).

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum IniError {
    #[error("{path}:{line}: duplicate section [{name}]")]
    DuplicateSection { path: String, line: usize, name: String },
    #[error("{path}:{line}: duplicate option '{name}' in [{section}]")]
    DuplicateOption { path: String, line: usize, section: String, name: String },
    #[error("{path}:{line}: option outside any section: {text}")]
    OptionOutsideSection { path: String, line: usize, text: String },
    #[error("{path}:{line}: malformed line: {text}")]
    Malformed { path: String, line: usize, text: String },
    #[error("{path}:{line}: continuation line before any option")]
    DanglingContinuation { path: String, line: usize },
}

/// One `[section]` block, preserving declaration order of its options.
#[derive(Debug, Clone, Default)]
pub struct IniSection {
    pub name: String,
    pub line: usize,
    pub options: Vec<(String, String)>,
}

impl IniSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// A parsed file: ordered list of sections in declaration order.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    pub sections: Vec<IniSection>,
}

impl IniDocument {
    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }
}

/// Parse INI text under strict duplicate-rejection rules.
///
/// `path` is used only for error messages.
pub fn parse(path: &Path, text: &str) -> Result<IniDocument, IniError> {
    let path_s = path.display().to_string();
    let mut doc = IniDocument::default();
    let mut current: Option<IniSection> = None;
    let mut last_option: Option<usize> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;

        // Continuation: non-blank line starting with whitespace extends the
        // previous option's value with a newline.
        if !raw_line.is_empty() && raw_line.starts_with(|c: char| c == ' ' || c == '\t') {
            let trimmed = raw_line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let section = current.as_mut().ok_or_else(|| IniError::DanglingContinuation {
                path: path_s.clone(),
                line: line_no,
            })?;
            let opt_idx = last_option.ok_or_else(|| IniError::DanglingContinuation {
                path: path_s.clone(),
                line: line_no,
            })?;
            section.options[opt_idx].1.push('\n');
            section.options[opt_idx].1.push_str(trimmed);
            continue;
        }

        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            if let Some(name) = rest.strip_suffix(']') {
                if let Some(prev) = current.take() {
                    doc.sections.push(prev);
                }
                if doc.sections.iter().any(|s| s.name == name) {
                    return Err(IniError::DuplicateSection {
                        path: path_s,
                        line: line_no,
                        name: name.to_string(),
                    });
                }
                current = Some(IniSection { name: name.to_string(), line: line_no, options: Vec::new() });
                last_option = None;
                continue;
            }
            return Err(IniError::Malformed { path: path_s, line: line_no, text: line.to_string() });
        }

        // option: key (':' | '=') value
        let split_at = line
            .find(|c| c == ':' || c == '=')
            .ok_or_else(|| IniError::Malformed { path: path_s.clone(), line: line_no, text: line.to_string() })?;
        let key = line[..split_at].trim();
        let value = line[split_at + 1..].trim();
        if key.is_empty() {
            return Err(IniError::Malformed { path: path_s, line: line_no, text: line.to_string() });
        }

        let section = current.as_mut().ok_or_else(|| IniError::OptionOutsideSection {
            path: path_s.clone(),
            line: line_no,
            text: line.to_string(),
        })?;

        if section.options.iter().any(|(k, _)| k == key) {
            return Err(IniError::DuplicateOption {
                path: path_s,
                line: line_no,
                section: section.name.clone(),
                name: key.to_string(),
            });
        }
        section.options.push((key.to_string(), value.to_string()));
        last_option = Some(section.options.len() - 1);
    }

    if let Some(prev) = current.take() {
        doc.sections.push(prev);
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p() -> PathBuf {
        PathBuf::from("test.conf")
    }

    #[test]
    fn parses_sections_and_options_in_order() {
        let doc = parse(&p(), "[global]\nfoo = 1\nbar: two\n\n[other]\nbaz=3\n").unwrap();
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.sections[0].name, "global");
        assert_eq!(doc.sections[0].options, vec![("foo".into(), "1".into()), ("bar".into(), "two".into())]);
        assert_eq!(doc.sections[1].name, "other");
    }

    #[test]
    fn rejects_duplicate_section() {
        let err = parse(&p(), "[a]\nx=1\n[a]\ny=2\n").unwrap_err();
        assert!(matches!(err, IniError::DuplicateSection { .. }));
    }

    #[test]
    fn rejects_duplicate_option() {
        let err = parse(&p(), "[a]\nx=1\nx=2\n").unwrap_err();
        assert!(matches!(err, IniError::DuplicateOption { .. }));
    }

    #[test]
    fn continuation_lines_join_with_newline() {
        let doc = parse(&p(), "[a]\nmatch = ^foo\n  ^bar\n  ^baz\n").unwrap();
        assert_eq!(doc.sections[0].get("match"), Some("^foo\n^bar\n^baz"));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let doc = parse(&p(), "; a comment\n\n# another\n[a]\nx=1\n").unwrap();
        assert_eq!(doc.sections[0].get("x"), Some("1"));
    }

    #[test]
    fn rejects_option_outside_section() {
        let err = parse(&p(), "x=1\n[a]\ny=2\n").unwrap_err();
        assert!(matches!(err, IniError::OptionOutsideSection { .. }));
    }
}
