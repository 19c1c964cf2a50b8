use crate::model::RawTileOutput;
use crate::raster::ChannelsMapping;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Identity of one tile's inference input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    // f64 bit patterns: tiles come from the same grid arithmetic, so equal
    // origins are bit-identical.
    origin_x: u64,
    origin_y: u64,
    resolution: u64,
    model_identity: String,
    channels: ChannelsMapping,
}

impl TileCacheKey {
    pub fn new(
        origin: (f64, f64),
        resolution_m_per_px: f64,
        model_identity: impl Into<String>,
        channels: ChannelsMapping,
    ) -> Self {
        Self {
            origin_x: origin.0.to_bits(),
            origin_y: origin.1.to_bits(),
            resolution: resolution_m_per_px.to_bits(),
            model_identity: model_identity.into(),
            channels,
        }
    }

    pub fn origin(&self) -> (f64, f64) {
        (f64::from_bits(self.origin_x), f64::from_bits(self.origin_y))
    }
}

enum Slot {
    Pending,
    Ready(RawTileOutput),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that found the key being computed by another run.
    pub in_flight: u64,
}

/// Outcome of a non-blocking lookup.
pub enum Lookup<'c> {
    Hit(RawTileOutput),
    /// The caller now computes this key.
    Claimed(Claim<'c>),
    /// Another caller is computing this key.
    InFlight,
}

/// Exclusive right to compute one key. Released on drop if not fulfilled.
pub struct Claim<'c> {
    cache: &'c TileCache,
    key: Option<TileCacheKey>,
}

impl<'c> Claim<'c> {
    pub fn fulfil(mut self, value: RawTileOutput) {
        if let Some(key) = self.key.take() {
            self.cache.publish(key, value);
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cache.release(&key);
        }
    }
}

/// Raw tile outputs shared between runs, each key computed at most once.
///
/// The first caller to miss gets a [`Claim`] and publishes through it; later
/// callers see the key in flight and may block in [`TileCache::wait_for`].
/// An unfulfilled claim is released on drop and a waiter takes it over.
#[derive(Default)]
pub struct TileCache {
    slots: Mutex<HashMap<TileCacheKey, Slot>>,
    published: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
    in_flight: AtomicU64,
}

impl TileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<TileCacheKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks `key` up without blocking.
    pub fn try_claim(&self, key: &TileCacheKey) -> Lookup<'_> {
        let mut slots = self.slots();
        match slots.get(key) {
            Some(Slot::Ready(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(value.clone())
            }
            Some(Slot::Pending) => {
                self.in_flight.fetch_add(1, Ordering::Relaxed);
                Lookup::InFlight
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                slots.insert(key.clone(), Slot::Pending);
                Lookup::Claimed(Claim {
                    cache: self,
                    key: Some(key.clone()),
                })
            }
        }
    }

    /// Blocks until `key` is no longer in flight.
    ///
    /// Never returns [`Lookup::InFlight`]. Callers must not hold unfulfilled
    /// claims while waiting, or two runs can wait on each other.
    pub fn wait_for(&self, key: &TileCacheKey) -> Lookup<'_> {
        let mut slots = self.slots();
        loop {
            match slots.get(key) {
                Some(Slot::Ready(value)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Lookup::Hit(value.clone());
                }
                Some(Slot::Pending) => {
                    slots = self
                        .published
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    slots.insert(key.clone(), Slot::Pending);
                    return Lookup::Claimed(Claim {
                        cache: self,
                        key: Some(key.clone()),
                    });
                }
            }
        }
    }

    pub fn get(&self, key: &TileCacheKey) -> Option<RawTileOutput> {
        match self.slots().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    fn publish(&self, key: TileCacheKey, value: RawTileOutput) {
        self.slots().insert(key, Slot::Ready(value));
        self.published.notify_all();
    }

    fn release(&self, key: &TileCacheKey) {
        debug!("Releasing abandoned cache claim for tile at {:?}", key.origin());
        let mut slots = self.slots();
        if matches!(slots.get(key), Some(Slot::Pending)) {
            slots.remove(key);
        }
        drop(slots);
        self.published.notify_all();
    }

    /// Number of computed entries.
    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops computed entries. Keys currently in flight are kept.
    pub fn clear(&self) {
        self.slots().retain(|_, slot| matches!(slot, Slot::Pending));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
