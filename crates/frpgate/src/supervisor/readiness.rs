//! Readiness probing of a freshly spawned tunnel client.
//!
//! frpc reports a registered proxy with a `start proxy success` line and a
//! refused one with `start error` / `start proxy error`. The probe scans
//! output as it arrives and polls liveness with exponential backoff until
//! one of those happens, the child exits or the deadline passes.

use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use super::policy::BackoffPolicy;
use super::process::TunnelChild;
use crate::error::TunnelError;

/// Printed by frpc >= 0.52 once the server accepted the proxy.
pub const READY_MARKER: &str = "start proxy success";

/// Output lines kept per tunnel for crash reports.
pub const OUTPUT_TAIL_LINES: usize = 50;

/// How long to keep reading an exited child's pipes.
pub const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(250);

#[allow(clippy::expect_used)]
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::\d+)?")
        .expect("static regex is valid")
});

/// Printed when the server refused the proxy (name clash, taken subdomain...).
/// Anchored on word boundaries so "restart error" does not match.
#[allow(clippy::expect_used)]
static REJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstart (?:proxy )?error\b").expect("static regex is valid")
});

/// What a single output line means for readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSignal {
    Ready,
    Rejected(String),
}

/// Classify one line of frpc output.
pub fn classify_line(line: &str) -> Option<OutputSignal> {
    if let Some(marker) = REJECT_RE.find(line) {
        let reason = line[marker.end()..]
            .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
            .trim();
        let reason = if reason.is_empty() { line.trim() } else { reason };
        return Some(OutputSignal::Rejected(reason.to_string()));
    }
    line.to_ascii_lowercase()
        .contains(READY_MARKER)
        .then_some(OutputSignal::Ready)
}

/// First URL in `line` whose host lies under `tunnel_domain`.
pub fn extract_public_url(line: &str, tunnel_domain: &str) -> Option<String> {
    let domain = tunnel_domain.trim_matches('.').to_ascii_lowercase();
    URL_RE.find_iter(line).find_map(|m| {
        let url = m.as_str();
        let host = url
            .split_once("://")
            .map_or(url, |(_, rest)| rest)
            .split(':')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let under_domain = host == domain || host.ends_with(&format!(".{domain}"));
        under_domain.then(|| url.to_string())
    })
}

/// Bounded ring of the most recent output lines.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::with_capacity(OUTPUT_TAIL_LINES)
    }
}

impl OutputTail {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Move everything currently buffered in `output` into the tail.
    /// Returns `false` once the channel is closed.
    pub fn drain(&mut self, output: &mut mpsc::Receiver<String>) -> bool {
        loop {
            match output.try_recv() {
                Ok(line) => self.push(line),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Collect what an exited child wrote until its pipes close, waiting at
    /// most `limit`.
    pub async fn drain_until_closed(&mut self, output: &mut mpsc::Receiver<String>, limit: Duration) {
        let collect = async {
            while let Some(line) = output.recv().await {
                self.push(line);
            }
        };
        let _ = tokio::time::timeout(limit, collect).await;
    }
}

/// Parameters of one readiness wait.
#[derive(Debug, Clone)]
pub struct ReadinessProbe<'a> {
    pub tunnel_id: &'a str,
    pub tunnel_domain: &'a str,
    pub timeout: Duration,
    pub poll: &'a BackoffPolicy,
    /// Treat a child that stays alive this long as ready even without the marker.
    pub warmup: Option<Duration>,
}

impl ReadinessProbe<'_> {
    /// Record `line`; `Ok(true)` once the proxy is up.
    fn scan(
        &self,
        line: String,
        tail: &mut OutputTail,
        reported_url: &mut Option<String>,
    ) -> Result<bool, TunnelError> {
        if reported_url.is_none() {
            *reported_url = extract_public_url(&line, self.tunnel_domain);
        }
        let signal = classify_line(&line);
        tail.push(line);
        match signal {
            Some(OutputSignal::Ready) => Ok(true),
            Some(OutputSignal::Rejected(reason)) => Err(TunnelError::ProxyRejected {
                tunnel_id: self.tunnel_id.to_string(),
                reason,
            }),
            None => Ok(false),
        }
    }
}

/// Wait until the child reports readiness.
///
/// Returns the public URL the client printed, if any. On error the child is
/// left as is; the caller decides whether to kill it.
pub async fn await_ready(
    child: &mut dyn TunnelChild,
    output: &mut mpsc::Receiver<String>,
    tail: &mut OutputTail,
    probe: &ReadinessProbe<'_>,
) -> Result<Option<String>, TunnelError> {
    let started = Instant::now();
    let deadline = started + probe.timeout;
    let mut reported_url = None;
    let mut output_open = true;
    let mut attempt = 0u32;

    loop {
        while output_open {
            match output.try_recv() {
                Ok(line) => {
                    if probe.scan(line, tail, &mut reported_url)? {
                        return Ok(reported_url);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => output_open = false,
            }
        }

        if let Some(exit) = child.try_wait()? {
            // Lines written right before exit may still be in flight.
            tail.drain_until_closed(output, EXIT_OUTPUT_GRACE).await;
            warn!(
                tunnel_id = %probe.tunnel_id,
                exit = %exit,
                "Tunnel client exited before becoming ready"
            );
            return Err(TunnelError::ProcessCrashed {
                tunnel_id: probe.tunnel_id.to_string(),
                exit_code: exit.code,
                output: tail.lines(),
            });
        }

        let now = Instant::now();
        if let Some(warmup) = probe.warmup
            && now.duration_since(started) >= warmup
        {
            info!(
                tunnel_id = %probe.tunnel_id,
                warmup_ms = warmup.as_millis(),
                "No readiness marker, treating live client as ready after warm-up"
            );
            return Ok(reported_url);
        }

        if now >= deadline {
            return Err(TunnelError::TunnelStartTimeout {
                tunnel_id: probe.tunnel_id.to_string(),
                waited_ms: now.duration_since(started).as_millis(),
            });
        }

        let delay = probe
            .poll
            .delay_for_attempt(attempt)
            .min(deadline.saturating_duration_since(now));
        attempt = attempt.saturating_add(1);
        debug!(tunnel_id = %probe.tunnel_id, attempt, delay_ms = delay.as_millis(), "Waiting for readiness");

        if output_open {
            match tokio::time::timeout(delay, output.recv()).await {
                Ok(Some(line)) => {
                    if probe.scan(line, tail, &mut reported_url)? {
                        return Ok(reported_url);
                    }
                }
                Ok(None) => output_open = false,
                Err(_) => {}
            }
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn detects_ready_marker() {
        let line = "2024-05-01 10:00:00.000 [I] [proxy/proxy_wrapper.go:204] [frpgate-1] start proxy success";
        assert_eq!(classify_line(line), Some(OutputSignal::Ready));
        assert_eq!(classify_line("login to server success"), None);
    }

    #[test]
    fn detects_rejection_with_reason() {
        let line = "[W] [proxy] [frpgate-1] start error: router config conflict";
        assert_eq!(
            classify_line(line),
            Some(OutputSignal::Rejected("router config conflict".into()))
        );
        assert_eq!(classify_line("[W] [service.go:301] restart error budget reached"), None);
        assert_eq!(classify_line("[I] start errors are retried"), None);
    }

    #[test]
    fn rejection_without_reason_keeps_line() {
        let line = "[W] start proxy error";
        assert_eq!(
            classify_line(line),
            Some(OutputSignal::Rejected("[W] start proxy error".into()))
        );
    }

    #[test]
    fn url_must_be_under_tunnel_domain() {
        let domain = "tunnel.example.com";
        assert_eq!(
            extract_public_url("visit https://abc.tunnel.example.com now", domain),
            Some("https://abc.tunnel.example.com".into())
        );
        assert_eq!(
            extract_public_url("see http://github.com/fatedier/frp", domain),
            None
        );
        assert_eq!(
            extract_public_url("http://eviltunnel.example.com", domain),
            None
        );
    }

    #[test]
    fn tail_keeps_most_recent_lines() {
        let mut tail = OutputTail::with_capacity(2);
        tail.push("a".into());
        tail.push("b".into());
        tail.push("c".into());
        assert_eq!(tail.lines(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn drain_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send("one".to_string()).await.unwrap();
        let mut tail = OutputTail::default();
        assert!(tail.drain(&mut rx));
        drop(tx);
        assert!(!tail.drain(&mut rx));
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn drain_until_closed_collects_late_lines() {
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send("late".to_string()).await.unwrap();
        });
        let mut tail = OutputTail::default();
        tail.drain_until_closed(&mut rx, Duration::from_secs(1)).await;
        assert_eq!(tail.lines(), vec!["late".to_string()]);
    }
}
