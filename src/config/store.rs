//! Flat INI-style key/value store with `${key}` interpolation.
//!
//! The dialect is deliberately small:
//!
//! - `[name]` starts a section; `[DEFAULT]` is the fallback section and any
//!   pairs written before the first header land there too
//! - `key = value` or `key: value`, split on the first delimiter
//! - keys are case-insensitive on lookup but keep their spelling on write
//! - `#` and `;` start full-line comments
//! - an indented line directly after a pair continues its value; a blank
//!   line ends it, unlike configparser, which keeps blank lines inside values
//!
//! Values are stored exactly as they appear in the file and interpolated when
//! read: `${key}` resolves in the same section (then DEFAULT),
//! `${section:key}` in a named section, and `$$` is a literal dollar sign.

use std::fmt;
use std::fs;
use std::path::Path;

use super::ConfigError;

/// Name of the fallback section visible from every other section.
pub const DEFAULT_SECTION: &str = "DEFAULT";

/// Maximum nesting of `${...}` references before giving up (also stops cycles).
const MAX_INTERPOLATION_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    name: String,
    /// `(key, raw value)` pairs in file order.
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.position(key).map(|idx| self.entries[idx].1.as_str())
    }

    fn set(&mut self, key: &str, raw: String) {
        match self.position(key) {
            Some(idx) => self.entries[idx].1 = raw,
            None => self.entries.push((key.to_string(), raw)),
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Parsed configuration document: one DEFAULT section plus named sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    defaults: Section,
    sections: Vec<Section>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            defaults: Section::new(DEFAULT_SECTION),
            sections: Vec::new(),
        }
    }

    /// Parse a document from text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut store = Self::new();
        // `None` is the DEFAULT section.
        let mut current: Option<usize> = None;
        let mut seen_default_header = false;
        let mut last_key: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();

            if line.is_empty() {
                last_key = None;
                continue;
            }
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if raw_line.starts_with([' ', '\t'])
                && let Some(key) = &last_key
            {
                let section = store.section_at_mut(current);
                if let Some(pos) = section.position(key) {
                    let value = &mut section.entries[pos].1;
                    if !value.is_empty() {
                        value.push('\n');
                    }
                    value.push_str(line);
                }
                continue;
            }

            if let Some(header) = line.strip_prefix('[') {
                let Some(name) = header.strip_suffix(']') else {
                    return Err(parse_error(line_no, "unterminated section header"));
                };
                if name.is_empty() {
                    return Err(parse_error(line_no, "empty section name"));
                }
                if name == DEFAULT_SECTION {
                    if seen_default_header {
                        return Err(parse_error(
                            line_no,
                            format!("section '{name}' already exists"),
                        ));
                    }
                    seen_default_header = true;
                    current = None;
                } else {
                    if store.sections.iter().any(|s| s.name == name) {
                        return Err(parse_error(
                            line_no,
                            format!("section '{name}' already exists"),
                        ));
                    }
                    store.sections.push(Section::new(name));
                    current = Some(store.sections.len() - 1);
                }
                last_key = None;
                continue;
            }

            let Some(delim) = line.find(['=', ':']) else {
                return Err(parse_error(line_no, format!("expected 'key = value', got '{line}'")));
            };
            let key = line[..delim].trim();
            let value = line[delim + 1..].trim();
            if key.is_empty() {
                return Err(parse_error(line_no, "empty key"));
            }

            let section = store.section_at_mut(current);
            if section.position(key).is_some() {
                return Err(parse_error(
                    line_no,
                    format!("key '{key}' already exists in section '{}'", section.name),
                ));
            }
            section.entries.push((key.to_string(), value.to_string()));
            last_key = Some(key.to_string());
        }

        Ok(store)
    }

    /// Read and parse a file.
    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Serialize the store to `path`, replacing any existing content.
    pub fn write_file(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Names of the non-default sections, in file order.
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    /// True for DEFAULT and for every named section present in the document.
    pub fn has_section(&self, name: &str) -> bool {
        name == DEFAULT_SECTION || self.find_section(name).is_some()
    }

    /// Whether `key` is visible from `section` (directly or through DEFAULT).
    pub fn contains_key(&self, section: &str, key: &str) -> bool {
        self.get_raw(section, key).is_some()
    }

    /// Uninterpolated value of `key` as seen from `section`.
    pub fn get_raw(&self, section: &str, key: &str) -> Option<&str> {
        self.find_section(section)
            .and_then(|s| s.get(key))
            .or_else(|| self.defaults.get(key))
    }

    /// Interpolated value of `key` as seen from `section`.
    ///
    /// Returns `Ok(None)` when the key is absent; interpolation problems are
    /// errors.
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get_raw(section, key) {
            Some(raw) => self.interpolate(section, key, raw, 1).map(Some),
            None => Ok(None),
        }
    }

    /// Store a literal value; `$` is escaped so it reads back unchanged.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        self.set_raw(section, key, &value.replace('$', "$$"));
    }

    /// Store a value verbatim, keeping any `${...}` references live.
    ///
    /// Creates the section when it does not exist yet.
    pub fn set_raw(&mut self, section: &str, key: &str, raw: &str) {
        self.section_mut_or_insert(section).set(key, raw.to_string());
    }

    /// Remove `key` from `section` (not from DEFAULT when looking through).
    pub fn remove(&mut self, section: &str, key: &str) -> bool {
        if section == DEFAULT_SECTION {
            return self.defaults.remove(key);
        }
        self.sections
            .iter_mut()
            .find(|s| s.name == section)
            .is_some_and(|s| s.remove(key))
    }

    fn find_section(&self, name: &str) -> Option<&Section> {
        if name == DEFAULT_SECTION {
            Some(&self.defaults)
        } else {
            self.sections.iter().find(|s| s.name == name)
        }
    }

    fn section_at_mut(&mut self, idx: Option<usize>) -> &mut Section {
        match idx {
            Some(idx) => &mut self.sections[idx],
            None => &mut self.defaults,
        }
    }

    fn section_mut_or_insert(&mut self, name: &str) -> &mut Section {
        if name == DEFAULT_SECTION {
            return &mut self.defaults;
        }
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    fn interpolate(
        &self,
        section: &str,
        key: &str,
        raw: &str,
        depth: usize,
    ) -> Result<String, ConfigError> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(ConfigError::InterpolationDepth {
                key: key.to_string(),
                max: MAX_INTERPOLATION_DEPTH,
            });
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];

            if let Some(after) = rest.strip_prefix('$') {
                out.push('$');
                rest = after;
                continue;
            }

            let Some(body) = rest.strip_prefix('{') else {
                return Err(syntax_error(key, "'$' must be followed by '$' or '{'"));
            };
            let Some(end) = body.find('}') else {
                return Err(syntax_error(key, "unterminated '${' reference"));
            };
            let reference = &body[..end];
            rest = &body[end + 1..];

            let (ref_section, ref_key, named) = match reference.split_once(':') {
                Some((s, k)) => (s, k, true),
                None => (section, reference, false),
            };
            if ref_key.is_empty() || ref_key.contains(':') {
                return Err(syntax_error(
                    key,
                    format!("malformed reference '${{{reference}}}'"),
                ));
            }

            let missing = || ConfigError::InterpolationMissing {
                key: key.to_string(),
                reference: reference.to_string(),
            };
            let target_section = self.find_section(ref_section);
            if named && target_section.is_none() {
                return Err(missing());
            }
            let value = target_section
                .and_then(|s| s.get(ref_key))
                .or_else(|| self.defaults.get(ref_key))
                .ok_or_else(missing)?;

            if value.contains('$') {
                out.push_str(&self.interpolate(ref_section, ref_key, value, depth + 1)?);
            } else {
                out.push_str(value);
            }
        }

        out.push_str(rest);
        Ok(out)
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> ConfigError {
    ConfigError::Parse {
        line,
        message: message.into(),
    }
}

fn syntax_error(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InterpolationSyntax {
        key: key.to_string(),
        message: message.into(),
    }
}

fn write_section(f: &mut fmt::Formatter<'_>, section: &Section) -> fmt::Result {
    writeln!(f, "[{}]", section.name)?;
    for (key, raw) in &section.entries {
        writeln!(f, "{} = {}", key, raw.replace('\n', "\n\t"))?;
    }
    writeln!(f)
}

impl fmt::Display for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.defaults.entries.is_empty() {
            write_section(f, &self.defaults)?;
        }
        for section in &self.sections {
            write_section(f, section)?;
        }
        Ok(())
    }
}
