//! StoreID helper wire protocol: a blocking line loop over stdin/stdout.
//!
//! Framing follows Squid's `store_id_program` contract, ground-truthed
//! against `Dedup.run()`/`Dedup.process()` in `dedup.py`: a serial request
//! is `<url> [options...]`, a concurrent one is `<channel-id> <url>
//! [options...]` where the channel id is detected by `options[0].isdigit()`.
//! The readiness wait mirrors the original's `select.select([sys.stdin],
//! ..., DEDUP_TIMEOUT)` poll loop, reimplemented with `libc::poll` so the
//! thread can notice shutdown/reload without blocking indefinitely on
//! `read_line`.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crossbeam_channel::Sender;

use crate::config::ConfigSnapshot;
use crate::rules::{ResolveOutcome, RuleEngine};

const POLL_TIMEOUT_MS: i32 = 500;

struct ParsedLine {
    channel: Option<String>,
    url: Option<String>,
}

fn parse_line(line: &str) -> ParsedLine {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        None => ParsedLine { channel: None, url: None },
        Some(first) if !first.is_empty() && first.bytes().all(|b| b.is_ascii_digit()) => {
            ParsedLine { channel: Some(first.to_string()), url: tokens.next().map(str::to_string) }
        }
        Some(first) => ParsedLine { channel: None, url: Some(first.to_string()) },
    }
}

fn format_reply(channel: &Option<String>, body: &str) -> String {
    match channel {
        Some(c) => format!("{c} {body}"),
        None => body.to_string(),
    }
}

/// Waits up to `POLL_TIMEOUT_MS` for stdin to become readable. Unix-only,
/// same as the signal model the supervisor relies on.
fn stdin_ready() -> bool {
    let mut fds = [libc::pollfd { fd: 0, events: libc::POLLIN, revents: 0 }];
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, POLL_TIMEOUT_MS) };
    ret > 0 && (fds[0].revents & libc::POLLIN) != 0
}

fn append_protocol_log(path: &Path, request: &str, reply: &str) -> io::Result<()> {
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{request}")?;
    writeln!(f, "{reply}")?;
    Ok(())
}

/// Work that must happen only *after* the reply line is written and flushed
/// (§4.3's reply-first discipline): logging and the prefetch enqueue.
enum Deferred {
    Malformed,
    Hit { section_name: String, canonical: String, enqueue: Option<(String, String)> },
    Miss,
}

/// Runs the protocol loop until stdin hits EOF or `shutdown` is set. Rebuilds
/// the rule engine (and its memo cache) whenever the published snapshot
/// pointer changes out from under it.
pub fn run(
    published: Arc<RwLock<Arc<ConfigSnapshot>>>,
    prefetch_tx: Arc<RwLock<Sender<(String, String)>>>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut current = Arc::clone(&*published.read().unwrap());
    let mut engine = RuleEngine::new(Arc::clone(&current));

    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();

    while !shutdown.load(Ordering::Relaxed) {
        let latest = Arc::clone(&*published.read().unwrap());
        if !Arc::ptr_eq(&latest, &current) {
            log::info!("protocol loop: adopting new config snapshot, memo cache reset");
            current = latest;
            engine = RuleEngine::new(Arc::clone(&current));
        }

        if !stdin_ready() {
            continue;
        }

        let mut raw = String::new();
        let n = reader.read_line(&mut raw)?;
        if n == 0 {
            log::info!("protocol loop: stdin closed, shutting down");
            break;
        }
        while raw.ends_with('\n') || raw.ends_with('\r') {
            raw.pop();
        }

        let parsed = parse_line(&raw);
        let (reply, deferred) = match &parsed.url {
            None => (format_reply(&parsed.channel, "ERR"), Deferred::Malformed),
            Some(url) => match engine.resolve(url) {
                ResolveOutcome::Hit(res) => {
                    let reply = format_reply(&parsed.channel, &format!("OK store-id={}", res.canonical));
                    let enqueue = (res.fetch && !res.cached).then(|| (res.canonical.clone(), url.clone()));
                    (reply, Deferred::Hit { section_name: res.section_name, canonical: res.canonical, enqueue })
                }
                ResolveOutcome::Miss => (format_reply(&parsed.channel, "ERR"), Deferred::Miss),
            },
        };

        {
            let mut out = stdout.lock();
            writeln!(out, "{reply}")?;
            out.flush()?;
        }

        match deferred {
            Deferred::Malformed => log::error!("malformed request line: '{raw}'"),
            Deferred::Hit { section_name, canonical, enqueue } => {
                log::debug!("[{section_name}] {} -> {canonical}", parsed.url.as_deref().unwrap_or(""));
                if let Some((canonical, original)) = enqueue {
                    let tx = prefetch_tx.read().unwrap().clone();
                    if tx.try_send((canonical, original.clone())).is_err() {
                        log::warn!("prefetch queue full or closed, dropping {original}");
                    }
                }
            }
            Deferred::Miss => log::debug!("no rule matched: {}", parsed.url.as_deref().unwrap_or("")),
        }

        if let Some(path) = &current.protocol_log_path {
            if let Err(e) = append_protocol_log(path, &raw, &reply) {
                log::error!("{}: protocol log write failed: {e}", path.display());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_request_has_no_channel() {
        let p = parse_line("http://example.com/foo");
        assert_eq!(p.channel, None);
        assert_eq!(p.url.as_deref(), Some("http://example.com/foo"));
    }

    #[test]
    fn concurrent_request_splits_channel_and_url() {
        let p = parse_line("42 http://example.com/foo bar=1");
        assert_eq!(p.channel.as_deref(), Some("42"));
        assert_eq!(p.url.as_deref(), Some("http://example.com/foo"));
    }

    #[test]
    fn empty_line_is_malformed_without_channel() {
        let p = parse_line("");
        assert_eq!(p.channel, None);
        assert_eq!(p.url, None);
        assert_eq!(format_reply(&p.channel, "ERR"), "ERR");
    }

    #[test]
    fn channel_only_is_malformed_with_channel_preserved() {
        let p = parse_line("42");
        assert_eq!(p.channel.as_deref(), Some("42"));
        assert_eq!(p.url, None);
        assert_eq!(format_reply(&p.channel, "ERR"), "42 ERR");
    }
}
