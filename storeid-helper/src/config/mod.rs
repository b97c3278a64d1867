//! Rule-set loader: primary + auxiliary config files, glob includes,
//! `%(var)s` interpolation, and mtime-based hot-reload detection.
//!
//! Builds an immutable [`ConfigSnapshot`] the way the teacher's
//! `gateway_fast.rs` builds its `REDIRECT_RULES` snapshot from
//! `config::RoutingData` — except here the source of truth is a rule file on
//! disk rather than the in-memory `mini-config` store, so the snapshot also
//! carries the mtimes needed to detect when it goes stale.

mod ini;
mod value;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::{Regex, RegexBuilder};

pub use value::ValueError;

const RESERVED_GLOBAL: &str = "global";
/// Literal level names `logsetup.py`'s `loglevel_map` accepts for `loglevel`/
/// `sysloglevel`, alongside a plain numeric value.
const LOG_LEVEL_NAMES: &[&str] = &["CRITICAL", "ERROR", "WARNING", "INFO", "DEBUG", "TRACE"];
/// `[global]` keys that hold non-string (typed) values and therefore do not
/// participate in `%(var)s` interpolation (see §4.1: "only string values
/// participate; non-string fields are skipped").
const TYPED_GLOBAL_KEYS: &[&str] = &["fetch_threads", "fetch_delay", "auto_reload", "profile", "loglevel", "sysloglevel"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read primary config {0}: {1}")]
    ReadPrimary(PathBuf, std::io::Error),
    #[error("primary config parse error: {0}")]
    Parse(#[from] ini::IniError),
    #[error("invalid glob pattern '{0}': {1}")]
    Glob(String, glob::PatternError),
    #[error("invalid value in primary config: {0}")]
    Value(#[from] ValueError),
}

/// One named rewrite rule: an ordered list of regex patterns, a replacement
/// template (already `%(var)s`-interpolated and translated to the `regex`
/// crate's `${N}` backreference syntax), and a fetch flag.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub patterns: Vec<(String, Regex)>,
    pub replacement: String,
    pub fetch: bool,
    pub source_path: PathBuf,
    pub source_mtime: SystemTime,
}

/// Immutable, atomically-published configuration. Once built it is never
/// mutated; a reload produces a brand new snapshot.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub internal_domain: String,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub fetch_workers: u32,
    pub fetch_delay: Duration,
    pub auto_reload: bool,
    pub protocol_log_path: Option<PathBuf>,
    pub log_level: i64,
    pub log_file: String,
    pub syslog_level: Option<i64>,
    pub sections: Vec<Section>,
    pub primary_path: PathBuf,
    pub primary_mtime: SystemTime,
}

fn mtime(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

/// `\N` (N = 1..=9) backreferences, as used by the rule files' `replace`
/// templates, translated to the `regex` crate's `${N}` expand syntax. A
/// literal `$` in the template is escaped to `$$` so it survives `expand`
/// unchanged.
fn translate_backrefs(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'$' => {
                out.push_str("$$");
                i += 1;
            }
            b'\\' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() && bytes[i + 1] != b'0' => {
                out.push_str("${");
                out.push(bytes[i + 1] as char);
                out.push('}');
                i += 2;
            }
            _ => {
                let ch = template[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    out
}

/// String-valued `[global]` options become interpolation variables, keyed
/// by their literal option name (e.g. a rule author writes `%(intdomain)s`,
/// matching the key they set in `[global]`), excluding the handful of
/// options that hold typed (int/bool) values.
fn interpolation_vars(global: Option<&ini::IniSection>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    if let Some(section) = global {
        for (key, value) in &section.options {
            if !TYPED_GLOBAL_KEYS.contains(&key.as_str()) {
                vars.insert(key.clone(), value.clone());
            }
        }
    }
    vars
}

struct GlobalSettings {
    internal_domain: String,
    http_proxy: Option<String>,
    https_proxy: Option<String>,
    fetch_workers: u32,
    fetch_delay: Duration,
    auto_reload: bool,
    protocol_log_path: Option<PathBuf>,
    log_level: i64,
    log_file: String,
    syslog_level: Option<i64>,
    include: Vec<String>,
}

fn log_level_value(name: &str) -> i64 {
    match name {
        "CRITICAL" => 50,
        "ERROR" => 40,
        "WARNING" => 30,
        "INFO" => 20,
        "DEBUG" => 10,
        "TRACE" => 5,
        _ => unreachable!("checked against LOG_LEVEL_NAMES"),
    }
}

/// `loglevel`/`sysloglevel` accept either a plain integer or one of the
/// literal names `logsetup.py`'s `loglevel_map` maps to that integer
/// (`CRITICAL` .. `TRACE`), case-insensitive.
fn parse_log_level(option: &str, value: &str) -> Result<i64, ConfigError> {
    let trimmed = value.trim();
    if let Ok(n) = value::parse_int("global", option, trimmed) {
        return Ok(n);
    }
    let upper = trimmed.to_ascii_uppercase();
    value::check_allowed("global", option, &upper, Some(LOG_LEVEL_NAMES))?;
    Ok(log_level_value(&upper))
}

fn parse_global(global: Option<&ini::IniSection>) -> Result<GlobalSettings, ConfigError> {
    let get = |key: &str| global.and_then(|s| s.get(key));

    let fetch_workers = match get("fetch_threads") {
        Some(v) => {
            let n = value::parse_int("global", "fetch_threads", v)?;
            if n < 0 {
                log::warn!("global:fetch_threads is negative ({n}), clamping to 0");
                0
            } else {
                n as u32
            }
        }
        None => 0,
    };

    let fetch_delay = match get("fetch_delay") {
        Some(v) => {
            let n = value::parse_float("global", "fetch_delay", v)?;
            let secs = if n.is_finite() {
                n.max(0.0)
            } else {
                log::warn!("global:fetch_delay is not finite ({n}), using 0");
                0.0
            };
            Duration::from_secs_f64(secs)
        }
        None => Duration::from_secs(0),
    };

    let auto_reload = match get("auto_reload") {
        Some(v) => value::parse_bool("global", "auto_reload", v)?,
        None => true,
    };

    let protocol_log_path = match get("protocol") {
        Some(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => None,
    };

    let log_level = match get("loglevel") {
        Some(v) => parse_log_level("loglevel", v)?,
        None => 20,
    };

    let syslog_level = match get("sysloglevel") {
        Some(v) if !v.trim().is_empty() => Some(parse_log_level("sysloglevel", v)?),
        _ => None,
    };

    let log_file = get("logfile").unwrap_or("-").trim().to_string();
    let http_proxy = get("http_proxy").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let https_proxy = get("https_proxy").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let internal_domain = get("intdomain").unwrap_or("").trim().to_string();
    let include = match get("include") {
        Some(v) => value::split_list(v, ","),
        None => Vec::new(),
    };

    Ok(GlobalSettings {
        internal_domain,
        http_proxy,
        https_proxy,
        fetch_workers,
        fetch_delay,
        auto_reload,
        protocol_log_path,
        log_level,
        log_file,
        syslog_level,
        include,
    })
}

/// Compile one non-`global` INI section into a rule [`Section`], or `None`
/// if it's invalid (missing match/replace, or every pattern fails to
/// compile) — the caller logs and discards these, it never aborts the load.
fn build_section(
    raw: &ini::IniSection,
    path: &Path,
    source_mtime: SystemTime,
    vars: &HashMap<String, String>,
) -> Option<Section> {
    let match_raw = raw.get("match")?;
    let replace_raw = raw.get("replace")?;
    if match_raw.trim().is_empty() || replace_raw.trim().is_empty() {
        log::warn!("{}: section [{}] missing match/replace, skipping", path.display(), raw.name);
        return None;
    }

    let fetch = match raw.get("fetch") {
        Some(v) => match value::parse_bool(&raw.name, "fetch", v) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("{}: section [{}]: {e}, skipping", path.display(), raw.name);
                return None;
            }
        },
        None => false,
    };

    let mut patterns = Vec::new();
    for source in value::split_list(match_raw, "\n") {
        let interpolated = value::interpolate(&source, vars);
        match RegexBuilder::new(&interpolated).case_insensitive(true).build() {
            Ok(re) => patterns.push((interpolated, re)),
            Err(e) => {
                log::warn!("{}: section [{}]: bad pattern '{}': {e}", path.display(), raw.name, interpolated);
            }
        }
    }
    if patterns.is_empty() {
        log::warn!("{}: section [{}] has no usable patterns, skipping", path.display(), raw.name);
        return None;
    }

    let replacement = translate_backrefs(&value::interpolate(replace_raw, vars));

    Some(Section {
        name: raw.name.clone(),
        patterns,
        replacement,
        fetch,
        source_path: path.to_path_buf(),
        source_mtime,
    })
}

fn read_and_parse(path: &Path) -> Result<ini::IniDocument, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadPrimary(path.to_path_buf(), e))?;
    Ok(ini::parse(path, &text)?)
}

fn build(primary_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    let primary_mtime = mtime(primary_path).map_err(|e| ConfigError::ReadPrimary(primary_path.to_path_buf(), e))?;
    let primary_doc = read_and_parse(primary_path)?;
    let global = primary_doc.section(RESERVED_GLOBAL);
    let vars = interpolation_vars(global);
    let settings = parse_global(global)?;

    let mut section_names: HashSet<String> = HashSet::new();
    let mut sections = Vec::new();

    for raw in &primary_doc.sections {
        if raw.name == RESERVED_GLOBAL {
            continue;
        }
        if !section_names.insert(raw.name.clone()) {
            log::warn!("{}: duplicate section [{}], discarding second occurrence", primary_path.display(), raw.name);
            continue;
        }
        if let Some(section) = build_section(raw, primary_path, primary_mtime, &vars) {
            sections.push(section);
        } else {
            section_names.remove(&raw.name);
        }
    }

    let mut include_paths: Vec<PathBuf> = Vec::new();
    for pattern in &settings.include {
        let paths = glob::glob(pattern).map_err(|e| ConfigError::Glob(pattern.clone(), e))?;
        for entry in paths {
            match entry {
                Ok(p) => include_paths.push(p),
                Err(e) => log::error!("include glob '{pattern}' entry error: {e}"),
            }
        }
    }
    include_paths.sort();
    include_paths.dedup();

    for path in &include_paths {
        let aux_mtime = match mtime(path) {
            Ok(t) => t,
            Err(e) => {
                log::error!("{}: cannot stat included config: {e}", path.display());
                continue;
            }
        };
        let doc = match read_and_parse(path) {
            Ok(d) => d,
            Err(e) => {
                log::error!("{}: malformed auxiliary config, skipping: {e}", path.display());
                continue;
            }
        };
        for raw in &doc.sections {
            if raw.name == RESERVED_GLOBAL {
                log::warn!("{}: [global] in auxiliary file is ignored", path.display());
                continue;
            }
            if !section_names.insert(raw.name.clone()) {
                log::warn!("{}: duplicate section [{}] across files, discarding", path.display(), raw.name);
                continue;
            }
            if let Some(section) = build_section(raw, path, aux_mtime, &vars) {
                sections.push(section);
            } else {
                section_names.remove(&raw.name);
            }
        }
    }

    Ok(ConfigSnapshot {
        internal_domain: settings.internal_domain,
        http_proxy: settings.http_proxy,
        https_proxy: settings.https_proxy,
        fetch_workers: settings.fetch_workers,
        fetch_delay: settings.fetch_delay,
        auto_reload: settings.auto_reload,
        protocol_log_path: settings.protocol_log_path,
        log_level: settings.log_level,
        log_file: settings.log_file,
        syslog_level: settings.syslog_level,
        sections,
        primary_path: primary_path.to_path_buf(),
        primary_mtime,
    })
}

/// Load the primary file plus its glob-expanded includes, or fail fatally
/// (missing/malformed primary is a startup error per the error table).
pub fn load_initial(primary_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    build(primary_path)
}

/// Same contract as `load_initial`; used on hot reload.
pub fn reload(primary_path: &Path) -> Result<ConfigSnapshot, ConfigError> {
    build(primary_path)
}

/// True if any file contributing to `snapshot` has advanced past its
/// recorded mtime, or can no longer be stat'd (treated as "probably
/// changed", per §4.1).
pub fn needs_reload(snapshot: &ConfigSnapshot) -> bool {
    match mtime(&snapshot.primary_path) {
        Ok(t) if t <= snapshot.primary_mtime => {}
        Ok(_) => return true,
        Err(e) => {
            log::error!("{}: stat failed: {e}", snapshot.primary_path.display());
            return true;
        }
    }

    let mut checked: HashSet<&Path> = HashSet::new();
    for section in &snapshot.sections {
        if !checked.insert(&section.source_path) {
            continue;
        }
        match mtime(&section.source_path) {
            Ok(t) if t <= section.source_mtime => {}
            Ok(_) => return true,
            Err(e) => {
                log::error!("{}: stat failed: {e}", section.source_path.display());
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_single_section_and_admits_fetch_flag() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.conf");
        write(&primary, "[global]\nintdomain: squid.internal\n\n[sourceforge]\nmatch: ^http://[\\w.-]+\\.dl\\.sourceforge\\.net/(.*)\nreplace: http://dl.sourceforge.net.%(intdomain)s/\\1\nfetch: true\n");
        let snap = load_initial(&primary).unwrap();
        assert_eq!(snap.sections.len(), 1);
        assert_eq!(snap.sections[0].name, "sourceforge");
        assert!(snap.sections[0].fetch);
        assert_eq!(snap.sections[0].replacement, "http://dl.sourceforge.net.squid.internal/${1}");
    }

    #[test]
    fn duplicate_section_across_files_is_discarded() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.conf");
        let aux = dir.path().join("10-extra.conf");
        write(&primary, &format!("[global]\ninclude: {}\n\n[dup]\nmatch: ^a$\nreplace: A\n", aux.join("*.conf").display().to_string().replace("*.conf", "*.conf")));
        write(&aux, "[dup]\nmatch: ^b$\nreplace: B\n");
        let snap = load_initial(&primary).unwrap();
        assert_eq!(snap.sections.len(), 1);
        assert_eq!(snap.sections[0].replacement, "A");
    }

    #[test]
    fn section_without_match_or_replace_is_skipped() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.conf");
        write(&primary, "[global]\n\n[broken]\nmatch: ^a$\n");
        let snap = load_initial(&primary).unwrap();
        assert!(snap.sections.is_empty());
    }

    #[test]
    fn needs_reload_detects_mtime_advance() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.conf");
        write(&primary, "[global]\n\n[a]\nmatch: ^a$\nreplace: A\n");
        let snap = load_initial(&primary).unwrap();
        assert!(!needs_reload(&snap));

        // Force the mtime forward.
        let future = SystemTime::now() + Duration::from_secs(5);
        let f = std::fs::File::open(&primary).unwrap();
        f.set_modified(future).unwrap();
        assert!(needs_reload(&snap));
    }

    #[test]
    fn loglevel_accepts_numeric_and_literal_names() {
        assert_eq!(parse_log_level("loglevel", "40").unwrap(), 40);
        assert_eq!(parse_log_level("loglevel", "warning").unwrap(), 30);
        assert_eq!(parse_log_level("loglevel", "TRACE").unwrap(), 5);
        assert!(parse_log_level("loglevel", "bogus").is_err());
    }

    #[test]
    fn fetch_delay_accepts_fractional_seconds() {
        let dir = tempdir().unwrap();
        let primary = dir.path().join("primary.conf");
        write(&primary, "[global]\nfetch_delay: 1.5\n\n[a]\nmatch: ^a$\nreplace: A\n");
        let snap = load_initial(&primary).unwrap();
        assert_eq!(snap.fetch_delay, Duration::from_secs_f64(1.5));
    }

    #[test]
    fn missing_primary_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.conf");
        assert!(load_initial(&missing).is_err());
    }
}
