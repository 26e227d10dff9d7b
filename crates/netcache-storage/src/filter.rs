//! Bloom filters over key hashes
//!
//! A negative answer is authoritative, a positive one is a hint. The
//! storage keeps one filter for records and one for records whose body
//! lives in the blob store.

use netcache_common::Sha1Digest;

/// log2 of the number of bits in a filter
pub const TABLE_SIZE_LOG2: u32 = 18;

const TABLE_SIZE: usize = 1 << TABLE_SIZE_LOG2;
const TABLE_MASK: usize = TABLE_SIZE - 1;
const WORD_BITS: usize = u64::BITS as usize;
const PROBE_COUNT: usize = 3;

/// Fixed-size Bloom filter keyed by SHA-1 digests
#[derive(Clone)]
pub struct ContentsFilter {
    bits: Vec<u64>,
}

impl ContentsFilter {
    /// Create an empty filter
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: vec![0u64; TABLE_SIZE / WORD_BITS],
        }
    }

    /// The digest is already uniformly distributed, so the probes are just
    /// consecutive 32-bit chunks of it.
    fn probes(hash: &Sha1Digest) -> [usize; PROBE_COUNT] {
        let bytes = hash.as_bytes();
        std::array::from_fn(|i| {
            let chunk = [
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ];
            u32::from_le_bytes(chunk) as usize & TABLE_MASK
        })
    }

    /// Add a hash
    pub fn add(&mut self, hash: &Sha1Digest) {
        for bit in Self::probes(hash) {
            self.bits[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    /// Check whether a hash may have been added
    #[must_use]
    pub fn may_contain(&self, hash: &Sha1Digest) -> bool {
        Self::probes(hash)
            .into_iter()
            .all(|bit| self.bits[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0)
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Number of set bits
    #[must_use]
    pub fn count_set_bits(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Default for ContentsFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContentsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentsFilter")
            .field("set_bits", &self.count_set_bits())
            .finish()
    }
}

/// A filter that is rebuilt from disk in the background
///
/// Until the first rebuild lands there is no filter and every hash may be
/// present. While a rebuild runs, added hashes are logged and replayed into
/// the fresh filter so nothing stored meanwhile is lost.
#[derive(Debug, Default)]
pub struct RebuildableFilter {
    filter: Option<ContentsFilter>,
    rebuild_log: Option<Vec<Sha1Digest>>,
}

impl RebuildableFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a filter has been built
    #[must_use]
    pub fn is_built(&self) -> bool {
        self.filter.is_some()
    }

    #[must_use]
    pub fn is_rebuilding(&self) -> bool {
        self.rebuild_log.is_some()
    }

    #[must_use]
    pub fn may_contain(&self, hash: &Sha1Digest) -> bool {
        self.filter.as_ref().is_none_or(|f| f.may_contain(hash))
    }

    pub fn add(&mut self, hash: &Sha1Digest) {
        if let Some(log) = &mut self.rebuild_log {
            log.push(*hash);
        }
        if let Some(filter) = &mut self.filter {
            filter.add(hash);
        }
    }

    /// Start logging adds for the next [`RebuildableFilter::finish_rebuild`]
    pub fn begin_rebuild(&mut self) {
        self.rebuild_log = Some(Vec::new());
    }

    /// Install a freshly built filter, replaying adds since the rebuild began
    pub fn finish_rebuild(&mut self, mut fresh: ContentsFilter) {
        for hash in self.rebuild_log.take().unwrap_or_default() {
            fresh.add(&hash);
        }
        self.filter = Some(fresh);
    }

    /// Empty the filter. An unbuilt filter stays unbuilt.
    pub fn clear(&mut self) {
        if let Some(filter) = &mut self.filter {
            filter.clear();
        }
    }
}
