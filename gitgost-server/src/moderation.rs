//! Pseudonyms, karma and community reports.
//!
//! A pseudonym (`hash`) is an 8-hex HMAC over `(owner/repo#number, user
//! token)` keyed with a secret generated at process start. The secret is
//! deliberately not persisted, so pseudonyms are per-deployment and there
//! is no secret at rest. Karma and reports are durable in the datastore
//! when one is configured; the in-memory maps below keep a single node
//! coherent when it is not, and are all guarded by one mutex that is never
//! held across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::store::Datastore;

type HmacSha256 = Hmac<Sha256>;

const REPORT_WINDOW_SECS: i64 = 30 * 24 * 60 * 60;
const FLAGGED_COOLDOWN_SECS: i64 = 6 * 60 * 60;

/// Escalation state of a pseudonym, derived from its report count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Registered,
    Flagged,
    Blocked,
}

impl ReportState {
    pub fn from_count(count: i64) -> Self {
        match count {
            c if c >= 6 => ReportState::Blocked,
            c if c >= 3 => ReportState::Flagged,
            _ => ReportState::Registered,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReportState::Registered => "registered",
            ReportState::Flagged => "flagged",
            ReportState::Blocked => "blocked",
        }
    }
}

/// Generate the client-held token that keeps a pseudonym stable across
/// sessions on the same issue: 10 random bytes, base32, no padding.
pub fn generate_user_token() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

#[derive(Default)]
struct Maps {
    karma: HashMap<String, i64>,
    report_counts: HashMap<String, i64>,
    report_first_at: HashMap<String, DateTime<Utc>>,
    report_ips: HashMap<String, HashMap<String, DateTime<Utc>>>,
    flagged_last_action: HashMap<String, DateTime<Utc>>,
    blocked: HashSet<String>,
}

impl Maps {
    /// Lazily reset a hash whose first report fell out of the window.
    fn refresh_window(&mut self, hash: &str, now: DateTime<Utc>) {
        let expired = match self.report_first_at.get(hash) {
            Some(first) => (now - *first).num_seconds() > REPORT_WINDOW_SECS,
            None => true,
        };
        if expired {
            self.report_counts.insert(hash.to_string(), 0);
            self.report_first_at.insert(hash.to_string(), now);
            self.report_ips.insert(hash.to_string(), HashMap::new());
        }
    }
}

pub struct Moderation {
    secret: [u8; 32],
    store: Option<Arc<dyn Datastore>>,
    maps: Mutex<Maps>,
}

impl Moderation {
    pub fn new(store: Option<Arc<dyn Datastore>>) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            secret,
            store,
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Derive the 8-hex pseudonym for a user token on one issue/PR.
    /// Deterministic for the process lifetime; fresh after a restart.
    pub fn derive_hash(&self, owner: &str, repo: &str, number: u64, user_token: &str) -> String {
        let input = format!("{}/{}#{}|{}", owner, repo, number, user_token);
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(input.as_bytes());
        hex::encode(mac.finalize().into_bytes())[..8].to_string()
    }

    /// Current karma for a hash: memory first, then the datastore.
    pub async fn karma(&self, hash: &str) -> i64 {
        if let Some(karma) = self.maps.lock().unwrap().karma.get(hash).copied() {
            return karma;
        }
        if let Some(store) = &self.store {
            if let Ok(karma) = store.karma(hash).await {
                self.maps
                    .lock()
                    .unwrap()
                    .karma
                    .insert(hash.to_string(), karma);
                return karma;
            }
        }
        self.maps.lock().unwrap().karma.insert(hash.to_string(), 0);
        0
    }

    /// Write karma to memory and, best-effort, to the datastore.
    pub async fn set_karma(&self, hash: &str, karma: i64) {
        self.maps
            .lock()
            .unwrap()
            .karma
            .insert(hash.to_string(), karma);
        if let Some(store) = &self.store {
            if let Err(err) = store.upsert_karma(hash, karma).await {
                debug!("karma upsert failed for {}: {}", hash, err);
            }
        }
    }

    /// Record one report against `hash` from `ip` and return the count
    /// within the window. A repeated `(hash, ip)` inside the window is
    /// idempotent and returns the current count.
    pub async fn record_report(&self, hash: &str, ip: &str, now: DateTime<Utc>) -> i64 {
        if let Some(store) = &self.store {
            let window_start = now - chrono::Duration::seconds(REPORT_WINDOW_SECS);
            let _ = store.delete_reports_before(hash, window_start).await;
            if let Ok(true) = store.has_report_from_ip(hash, ip).await {
                if let Ok(count) = store.report_count(hash).await {
                    return count;
                }
                return 0;
            }
            if store.insert_report(hash, ip).await.is_ok() {
                if let Ok(count) = store.report_count(hash).await {
                    return count;
                }
            }
        }

        let mut maps = self.maps.lock().unwrap();
        maps.refresh_window(hash, now);
        if !ip.is_empty() {
            if let Some(seen) = maps.report_ips.get(hash).and_then(|ips| ips.get(ip)) {
                if (now - *seen).num_seconds() <= REPORT_WINDOW_SECS {
                    return maps.report_counts[hash];
                }
            }
        }
        let count = maps
            .report_counts
            .entry(hash.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        let count = *count;
        if !ip.is_empty() {
            maps.report_ips
                .entry(hash.to_string())
                .or_default()
                .insert(ip.to_string(), now);
        }
        count
    }

    /// Report count for `hash` within the window.
    pub async fn report_count(&self, hash: &str, now: DateTime<Utc>) -> i64 {
        if hash.is_empty() {
            return 0;
        }
        if let Some(store) = &self.store {
            let window_start = now - chrono::Duration::seconds(REPORT_WINDOW_SECS);
            let _ = store.delete_reports_before(hash, window_start).await;
            if let Ok(count) = store.report_count(hash).await {
                let mut maps = self.maps.lock().unwrap();
                maps.refresh_window(hash, now);
                let mem_count = maps.report_counts.get(hash).copied().unwrap_or(0);
                return count.max(mem_count);
            }
        }
        let mut maps = self.maps.lock().unwrap();
        maps.refresh_window(hash, now);
        maps.report_counts.get(hash).copied().unwrap_or(0)
    }

    pub fn mark_flagged_action(&self, hash: &str, now: DateTime<Utc>) {
        self.maps
            .lock()
            .unwrap()
            .flagged_last_action
            .insert(hash.to_string(), now);
    }

    /// True while a flagged hash is inside its 6-hour write cooldown.
    pub fn is_flagged_cooldown(&self, hash: &str, now: DateTime<Utc>) -> bool {
        self.maps
            .lock()
            .unwrap()
            .flagged_last_action
            .get(hash)
            .is_some_and(|last| (now - *last).num_seconds() < FLAGGED_COOLDOWN_SECS)
    }

    pub fn set_blocked(&self, hash: &str) {
        if hash.is_empty() {
            return;
        }
        self.maps.lock().unwrap().blocked.insert(hash.to_string());
    }

    pub fn is_blocked(&self, hash: &str) -> bool {
        !hash.is_empty() && self.maps.lock().unwrap().blocked.contains(hash)
    }
}
