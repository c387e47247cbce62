//! The replay ledger: bloom-assisted nonce tracking with precise TTL eviction.
//!
//! Membership is answered by a bloom filter **or** the exact map; rejection
//! is strict, so a bloom false positive rejects a legitimate nonce at the
//! configured rate rather than ever admitting a replay. The exact map keeps
//! first-seen timestamps so eviction is precise; when an eviction pass
//! removes enough of the population the bloom is rebuilt from the survivors
//! to shed stale bits.

use bloomfilter::Bloom;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cyb_core::now_ms;

/// Sizing and lifecycle parameters for the ledger.
#[derive(Debug, Clone, Copy)]
pub struct ReplayConfig {
    /// Expected nonce population the bloom is sized for.
    pub capacity: usize,
    /// Target bloom false-positive rate.
    pub fp_rate: f64,
    /// Horizon after which a nonce may be forgotten.
    pub window: Duration,
    /// Interval between compaction passes.
    pub compaction_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            fp_rate: 1e-3,
            window: Duration::from_secs(90),
            compaction_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    /// Entries removed because their first-seen age exceeded the window.
    pub evicted: usize,
    /// Entries that remain tracked.
    pub survivors: usize,
    /// Whether the bloom was rebuilt from the survivors.
    pub rebuilt: bool,
}

struct LedgerState {
    bloom: Bloom<String>,
    seen: HashMap<String, u64>,
}

/// Shared nonce ledger. One short critical section per message.
pub struct ReplayLedger {
    state: Mutex<LedgerState>,
    config: ReplayConfig,
}

impl std::fmt::Debug for ReplayLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReplayLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                bloom: Bloom::new_for_fp_rate(config.capacity, config.fp_rate),
                seen: HashMap::new(),
            }),
            config,
        }
    }

    /// The configured replay window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Atomically test freshness and record the nonce.
    ///
    /// Returns `true` if the nonce was fresh (now recorded), `false` if it
    /// was already seen inside the window (bloom or exact map).
    pub fn check_and_insert(&self, nonce: &str) -> bool {
        let now = now_ms();
        let mut state = self.lock();
        let nonce_owned = nonce.to_string();
        if state.bloom.check(&nonce_owned) || state.seen.contains_key(nonce) {
            return false;
        }
        state.bloom.set(&nonce_owned);
        state.seen.insert(nonce_owned, now);
        true
    }

    /// Whether the nonce is currently considered seen, without recording it.
    #[must_use]
    pub fn contains(&self, nonce: &str) -> bool {
        let state = self.lock();
        state.bloom.check(&nonce.to_string()) || state.seen.contains_key(nonce)
    }

    /// Number of precisely tracked nonces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    /// Whether the exact map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().seen.is_empty()
    }

    /// Evict expired entries; rebuild the bloom when the pass removed more
    /// than 30% of the pre-eviction population.
    pub fn compact(&self) -> CompactionStats {
        let now = now_ms();
        let window_ms = u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.lock();

        let before = state.seen.len();
        state
            .seen
            .retain(|_, first_seen| now.saturating_sub(*first_seen) <= window_ms);
        let survivors = state.seen.len();
        let evicted = before.saturating_sub(survivors);

        // survivors < 70% of the pre-eviction population
        let rebuilt = before > 0 && survivors.saturating_mul(10) < before.saturating_mul(7);
        if rebuilt {
            state.bloom.clear();
            let nonces: Vec<String> = state.seen.keys().cloned().collect();
            for nonce in &nonces {
                state.bloom.set(nonce);
            }
            debug!(survivors, evicted, "replay bloom rebuilt");
        }

        CompactionStats {
            evicted,
            survivors,
            rebuilt,
        }
    }

    /// Run periodic compaction until cancelled. Ingestion keeps its own
    /// short critical section; compaction never holds the lock across ticks.
    pub fn spawn_compactor(
        self: &std::sync::Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let ledger = std::sync::Arc::clone(self);
        let interval = ledger.config.compaction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = ledger.compact();
                        if stats.evicted > 0 {
                            debug!(
                                evicted = stats.evicted,
                                survivors = stats.survivors,
                                rebuilt = stats.rebuilt,
                                "replay ledger compacted"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Persist the bloom bitmap as flat binary.
    ///
    /// Only the bloom travels to disk; the exact map is rebuilt from live
    /// traffic, so a loaded bloom contributes membership (conservative
    /// rejection) until the first rebuild replaces it.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from writing the file.
    pub fn save_bloom(&self, path: &Path) -> std::io::Result<()> {
        let state = self.lock();
        let bitmap = state.bloom.bitmap();
        let sip_keys = state.bloom.sip_keys();

        let mut file = std::fs::File::create(path)?;
        file.write_all(b"CYBBLOOM")?;
        file.write_all(&state.bloom.number_of_bits().to_le_bytes())?;
        file.write_all(&state.bloom.number_of_hash_functions().to_le_bytes())?;
        for (k0, k1) in sip_keys {
            file.write_all(&k0.to_le_bytes())?;
            file.write_all(&k1.to_le_bytes())?;
        }
        file.write_all(&bitmap)?;
        info!(path = %path.display(), bytes = bitmap.len(), "replay bloom saved");
        Ok(())
    }

    /// Load a ledger whose bloom was previously saved with [`Self::save_bloom`].
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file is unreadable or the header does not
    /// match the expected layout.
    pub fn load_bloom(path: &Path, config: ReplayConfig) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != b"CYBBLOOM" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "not a bloom file",
            ));
        }

        let mut u64_buf = [0u8; 8];
        file.read_exact(&mut u64_buf)?;
        let bits = u64::from_le_bytes(u64_buf);

        let mut u32_buf = [0u8; 4];
        file.read_exact(&mut u32_buf)?;
        let k_num = u32::from_le_bytes(u32_buf);

        let mut sip_keys = [(0u64, 0u64); 2];
        for entry in &mut sip_keys {
            file.read_exact(&mut u64_buf)?;
            entry.0 = u64::from_le_bytes(u64_buf);
            file.read_exact(&mut u64_buf)?;
            entry.1 = u64::from_le_bytes(u64_buf);
        }

        let mut bitmap = Vec::new();
        file.read_to_end(&mut bitmap)?;

        let bloom = Bloom::from_existing(&bitmap, bits, k_num, sip_keys);
        info!(path = %path.display(), bytes = bitmap.len(), "replay bloom loaded");
        Ok(Self {
            state: Mutex::new(LedgerState {
                bloom,
                seen: HashMap::new(),
            }),
            config,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
