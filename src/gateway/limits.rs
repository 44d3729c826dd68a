//! Abuse protection for the public routes.
//!
//! Vendor webhooks and connect links are limited per caller IP. Messenger
//! redelivers a message when our 200 is slow, and Vitadock pushes carry a
//! nonce, so both go through a [`ReplayGuard`] that answers each id once.

use axum::http::HeaderMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const TRACKED_IPS_DEFAULT: usize = 10_000;
pub const REPLAY_GUARD_CAPACITY_DEFAULT: usize = 10_000;

/// Callers quiet for a full window are dropped at most this often.
const SWEEP_EVERY: Duration = Duration::from_secs(300);

/// Request times of one caller, oldest first.
#[derive(Debug, Default)]
struct Hits(VecDeque<Instant>);

impl Hits {
    fn forget_until(&mut self, cutoff: Instant) {
        while self.0.front().is_some_and(|at| *at <= cutoff) {
            self.0.pop_front();
        }
    }

    fn latest(&self) -> Option<Instant> {
        self.0.back().copied()
    }
}

#[derive(Debug)]
struct Callers {
    hits: HashMap<String, Hits>,
    swept_at: Instant,
}

impl Callers {
    fn sweep(&mut self, cutoff: Instant, now: Instant) {
        self.hits.retain(|_, hits| {
            hits.forget_until(cutoff);
            !hits.0.is_empty()
        });
        self.swept_at = now;
    }

    /// Drop the caller whose last request is longest ago.
    fn drop_quietest(&mut self) {
        let quietest = self
            .hits
            .iter()
            .min_by_key(|(_, hits)| hits.latest())
            .map(|(ip, _)| ip.clone());
        if let Some(ip) = quietest {
            self.hits.remove(&ip);
        }
    }
}

/// At most `max_hits` requests per caller in any `window`.
#[derive(Debug)]
struct PerCallerLimit {
    max_hits: u32,
    window: Duration,
    capacity: usize,
    callers: Mutex<Callers>,
}

impl PerCallerLimit {
    fn new(max_hits: u32, window: Duration, capacity: usize) -> Self {
        Self {
            max_hits,
            window,
            capacity: capacity.max(1),
            callers: Mutex::new(Callers {
                hits: HashMap::new(),
                swept_at: Instant::now(),
            }),
        }
    }

    fn allow(&self, ip: &str) -> bool {
        if self.max_hits == 0 {
            return true;
        }
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        let mut callers = self.callers.lock();

        if now.duration_since(callers.swept_at) >= SWEEP_EVERY {
            callers.sweep(cutoff, now);
        }
        if !callers.hits.contains_key(ip) && callers.hits.len() >= self.capacity {
            callers.sweep(cutoff, now);
            if callers.hits.len() >= self.capacity {
                callers.drop_quietest();
            }
        }

        let hits = callers.hits.entry(ip.to_owned()).or_default();
        hits.forget_until(cutoff);
        if hits.0.len() >= self.max_hits as usize {
            return false;
        }
        hits.0.push_back(now);
        true
    }
}

/// Limits for the two route groups. Connect links are opened by a person,
/// so they get a quarter of the webhook budget (at least 10 a minute).
#[derive(Debug)]
pub struct RouteLimits {
    webhook: PerCallerLimit,
    connect: PerCallerLimit,
}

impl RouteLimits {
    /// `0` requests per minute switches limiting off for both groups.
    pub fn new(webhook_per_minute: u32, tracked_ips: usize) -> Self {
        let connect_per_minute = match webhook_per_minute {
            0 => 0,
            n => (n / 4).max(10),
        };
        Self {
            webhook: PerCallerLimit::new(webhook_per_minute, RATE_LIMIT_WINDOW, tracked_ips),
            connect: PerCallerLimit::new(connect_per_minute, RATE_LIMIT_WINDOW, tracked_ips),
        }
    }

    pub fn allow_webhook(&self, ip: &str) -> bool {
        self.webhook.allow(ip)
    }

    pub fn allow_connect(&self, ip: &str) -> bool {
        self.connect.allow(ip)
    }
}

/// Ids seen within the last `ttl`, in arrival order.
///
/// Every id lives equally long, so expired ids are always at the front and
/// a full guard forgets its oldest id first.
#[derive(Debug)]
pub struct ReplayGuard {
    ttl: Duration,
    capacity: usize,
    seen: Mutex<SeenIds>,
}

#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenIds {
    fn forget_oldest(&mut self) {
        if let Some((id, _)) = self.order.pop_front() {
            self.ids.remove(&id);
        }
    }
}

impl ReplayGuard {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    /// True the first time `id` shows up within the ttl; the id is then remembered.
    pub fn first_seen(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.seen.lock();
        let seen = &mut *guard;

        while seen
            .order
            .front()
            .is_some_and(|(_, at)| now.duration_since(*at) >= self.ttl)
        {
            seen.forget_oldest();
        }
        if seen.ids.contains(id) {
            return false;
        }
        while seen.order.len() >= self.capacity {
            seen.forget_oldest();
        }
        seen.ids.insert(id.to_owned());
        seen.order.push_back((id.to_owned(), now));
        true
    }
}

/// An address as proxies write it: bare, quoted, bracketed or with a port.
fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim().trim_matches('"').trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
        .or_else(|| raw.trim_matches(['[', ']']).parse().ok())
}

/// The caller IP used as rate limit key.
///
/// Behind a reverse proxy the peer is the proxy itself, so with
/// `trust_forwarded` the first `X-Forwarded-For` hop (or `X-Real-IP`) wins.
pub fn caller_ip(peer: Option<SocketAddr>, headers: &HeaderMap, trust_forwarded: bool) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let forwarded = trust_forwarded
        .then(|| {
            header("X-Forwarded-For")
                .and_then(|hops| hops.split(',').find_map(parse_ip))
                .or_else(|| header("X-Real-IP").and_then(parse_ip))
        })
        .flatten();

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_string(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// A configured capacity of 0 means "use the default".
pub fn capacity_or(configured: usize, default: usize) -> usize {
    match configured {
        0 => default.max(1),
        n => n,
    }
}

/// Hex SHA-256 of a shared secret or token; the plaintext is not kept.
pub fn hash_secret(value: &str) -> String {
    use sha2::{Digest, Sha256};

    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Equality that looks at every byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |diff, (x, y)| diff | (x ^ y))
            == 0
}

/// False only for `localhost` and loopback addresses.
pub fn is_public_bind(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return false;
    }
    !parse_ip(host).is_some_and(|ip| ip.is_loopback())
}
