//! Small free-standing helpers ported from the reference `igvm/utils.py`:
//! size parsing, exponential-backoff retry, TCP reachability polling, and
//! the lazily-evaluated comparator used by the hypervisor selector.

use std::cmp::Ordering;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{IgvmError, Result};

/// Parse a human size string like `"10G"`, `"512Mi"`, `"4096MB"` into a
/// count of `unit` (one of `T`, `G`, `M`, `K`, `B`), rejecting values that
/// are not an exact multiple of `unit` (spec §6 `disk-set`/`mem-set`
/// accept sizes with unit suffixes; ported from `igvm/utils.py::parse_size`).
pub fn parse_size(text: &str, unit: char) -> Result<u64> {
    let mut s = text.trim().to_uppercase();
    let unit = unit.to_ascii_uppercase();

    if s.ends_with('B') {
        s.pop();
        if s.ends_with('I') {
            s.pop();
        }
    }
    if s.is_empty() {
        return Err(IgvmError::Config("empty size".into()));
    }

    let factor_of = |c: char| -> Result<u64> {
        Ok(match c {
            'T' => 1024u64.pow(4),
            'G' => 1024u64.pow(3),
            'M' => 1024u64.pow(2),
            'K' => 1024,
            'B' => 1,
            _ => return Err(IgvmError::Config(format!("unknown size unit {c}"))),
        })
    };

    let last = s.chars().last().unwrap();
    let (numeric, factor) = if "TGMKB".contains(last) {
        (&s[..s.len() - last.len_utf8()], factor_of(last)?)
    } else {
        (s.as_str(), factor_of(unit)?)
    };

    let value: f64 = numeric
        .parse()
        .map_err(|_| IgvmError::Config(format!("cannot parse \"{text}\" as a size")))?;
    let bytes = value * factor as f64;

    let unit_factor = factor_of(unit)? as f64;
    if (bytes % unit_factor).abs() > f64::EPSILON {
        return Err(IgvmError::Config(format!(
            "value must be a multiple of 1 {unit}iB"
        )));
    }
    Ok((bytes / unit_factor) as u64)
}

/// Exponential backoff starting at 100ms, doubling, capped at 5s, bounded by
/// a total wall-clock budget. Ported from `igvm/utils.py::retry_wait_backoff`.
/// `check` is polled until it returns `true` or the budget is exhausted.
pub async fn retry_wait_backoff<F, Fut>(mut check: F, fail_msg: &str, max_wait: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut sleep_time = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    loop {
        if check().await {
            return Ok(());
        }
        if waited >= max_wait {
            return Err(IgvmError::Timeout(format!(
                "{fail_msg} after {:.2}s",
                max_wait.as_secs_f64()
            )));
        }
        info!(retry_in = ?sleep_time, "{}, retrying", fail_msg);
        tokio::time::sleep(sleep_time).await;
        waited += sleep_time;
        sleep_time = sleep_time
            .mul_f64(2.0)
            .min(Duration::from_secs(5))
            .min(max_wait.saturating_sub(waited).max(Duration::from_millis(1)));
    }
}

/// Single TCP connect attempt with a short timeout (spec §4.I "wait for SSH").
pub async fn ping_port(ip: IpAddr, port: u16, connect_timeout: Duration) -> bool {
    timeout(connect_timeout, TcpStream::connect((ip, port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

/// Poll `ip:port` until it accepts a connection or `budget` expires (spec
/// §5 `wait_until(ip, port)`; default budget 60s per spec §4.I).
pub async fn wait_until(ip: IpAddr, port: u16, budget: Duration) -> Result<()> {
    debug!(%ip, port, "waiting for host to become reachable");
    retry_wait_backoff(
        || async move { ping_port(ip, port, Duration::from_secs(1)).await },
        &format!("{ip}:{port} not reachable"),
        budget,
    )
    .await
}

/// A memoizing thunk used by the hypervisor selector to compare candidates
/// without evaluating every preference up front (spec §4.K "lazy-compare
/// ranking", §9 "LazyCompare"). Each element of the comparison key is
/// computed only the first time it is touched by a comparison, and the
/// result is cached for subsequent comparisons against other candidates.
pub struct LazyKey<T> {
    compute: Box<dyn FnMut(usize) -> T + Send>,
    cache: Vec<Option<T>>,
    len: usize,
}

impl<T: PartialOrd + Clone> LazyKey<T> {
    /// `len` is the number of key elements (e.g. one per configured
    /// preference); `compute(i)` evaluates element `i` on first access.
    pub fn new(len: usize, compute: impl FnMut(usize) -> T + Send + 'static) -> Self {
        Self {
            compute: Box::new(compute),
            cache: vec![None; len],
            len,
        }
    }

    fn get(&mut self, i: usize) -> T {
        if self.cache[i].is_none() {
            self.cache[i] = Some((self.compute)(i));
        }
        self.cache[i].clone().unwrap()
    }

    /// Lexicographic comparison, evaluating only as many elements of each
    /// side as needed to find a difference.
    pub fn cmp(&mut self, other: &mut LazyKey<T>) -> Ordering
    where
        T: PartialOrd,
    {
        for i in 0..self.len.min(other.len) {
            let a = self.get(i);
            let b = other.get(i);
            match a.partial_cmp(&b) {
                Some(Ordering::Equal) | None => continue,
                Some(ord) => return ord,
            }
        }
        self.len.cmp(&other.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_handles_unit_suffixes() {
        assert_eq!(parse_size("10G", 'G').unwrap(), 10);
        assert_eq!(parse_size("10240M", 'G').unwrap(), 10);
        assert_eq!(parse_size("1TiB", 'G').unwrap(), 1024);
        assert_eq!(parse_size("2048", 'M').unwrap(), 2048);
    }

    #[test]
    fn parse_size_rejects_non_multiples() {
        assert!(parse_size("4097M", 'M').is_err());
        assert!(parse_size("1.5G", 'G').is_err());
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("", 'G').is_err());
        assert!(parse_size("abc", 'G').is_err());
    }

    #[tokio::test]
    async fn retry_wait_backoff_succeeds_immediately() {
        let result = retry_wait_backoff(|| async { true }, "never", Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retry_wait_backoff_times_out() {
        let result = retry_wait_backoff(|| async { false }, "nope", Duration::from_millis(250)).await;
        assert!(matches!(result, Err(IgvmError::Timeout(_))));
    }

    #[test]
    fn lazy_key_only_computes_touched_elements() {
        use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut a = LazyKey::new(3, move |i| {
            calls2.fetch_add(1, AOrdering::SeqCst);
            if i == 0 { 1.0 } else { 0.0 }
        });
        let mut b = LazyKey::new(3, |i| if i == 0 { 0.0 } else { 1.0 });
        assert_eq!(a.cmp(&mut b), Ordering::Greater);
        // Only element 0 needed to be computed on `a` to decide the order.
        assert_eq!(calls.load(AOrdering::SeqCst), 1);
    }
}
