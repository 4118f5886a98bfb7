//! Sharded manifest index with lazy shard loading.
//!
//! The full manifest is partitioned into shard files keyed by the low bits
//! of each asset's canonical identity. Shards are fetched lazily, at most
//! once, and merged into one logical manifest map. A shard that fails to
//! load is still marked loaded: one bad shard degrades to missing assets
//! rather than causing unbounded retry traffic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;

use crate::cache::ByteCache;
use crate::dedupe::InflightRegistry;
use crate::error::{Error, Result};
use crate::fetch::AssetFetcher;
use crate::identity::ArchetypeId;
use crate::scheduler::Priority;

/// LOD fallback chain, best quality first.
pub const LOD_FALLBACK: [&str; 4] = ["high", "med", "low", "vlow"];

/// Top-level manifest document.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub version: u32,
    /// Entries keyed by decimal identity strings.
    #[serde(default)]
    pub meshes: HashMap<String, ManifestEntry>,
}

/// A single asset's manifest entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    /// Submesh lists per level-of-detail name.
    #[serde(default)]
    pub lods: HashMap<String, LodEntry>,
    /// Entry-level material, shared by submeshes that do not override it.
    #[serde(default)]
    pub material: Option<Value>,
    /// Set once effective materials have been derived.
    #[serde(skip)]
    normalized: bool,
}

/// One level of detail: either an explicit submesh list or a bare file.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LodEntry {
    /// Multiple submeshes with optional per-submesh materials.
    Submeshes {
        /// The submeshes making up this LOD.
        submeshes: Vec<Submesh>,
    },
    /// Shorthand for a single submesh with no material override.
    Single {
        /// The mesh file path.
        file: String,
    },
}

/// A single submesh descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct Submesh {
    /// Mesh blob file path, relative to the asset tree.
    pub file: String,
    /// Effective material after normalization: entry-level fields
    /// overridden by submesh-level fields.
    #[serde(default)]
    pub material: Option<Value>,
}

impl ManifestEntry {
    /// Derive effective materials in place.
    ///
    /// Idempotent: the expensive merge runs exactly once per entry. Bare
    /// `file` LODs are rewritten into single-submesh lists so consumers see
    /// one shape.
    pub fn normalize(&mut self) {
        if self.normalized {
            return;
        }
        for lod in self.lods.values_mut() {
            if let LodEntry::Single { file } = lod {
                let file = std::mem::take(file);
                *lod = LodEntry::Submeshes {
                    submeshes: vec![Submesh {
                        file,
                        material: None,
                    }],
                };
            }
            if let LodEntry::Submeshes { submeshes } = lod {
                for submesh in submeshes {
                    submesh.material =
                        merge_materials(self.material.as_ref(), submesh.material.take());
                }
            }
        }
        self.normalized = true;
    }

    /// Submeshes for a LOD, falling back through `high → med → low → vlow`
    /// when the requested name is absent. Returns the resolved LOD name
    /// alongside its submeshes.
    #[must_use]
    pub fn resolve_lod(&self, requested: &str) -> Option<(&str, &[Submesh])> {
        std::iter::once(requested)
            .chain(LOD_FALLBACK)
            .find_map(|name| match self.lods.get_key_value(name) {
                Some((key, LodEntry::Submeshes { submeshes })) => {
                    Some((key.as_str(), submeshes.as_slice()))
                }
                _ => None,
            })
    }
}

/// Merge an entry-level material with a submesh override.
///
/// Both must be JSON objects for a field-wise merge; otherwise the override
/// wins outright.
fn merge_materials(base: Option<&Value>, over: Option<Value>) -> Option<Value> {
    match (base, over) {
        (Some(Value::Object(base)), Some(Value::Object(over))) => {
            let mut merged = base.clone();
            for (key, value) in over {
                merged.insert(key, value);
            }
            Some(Value::Object(merged))
        }
        (base, over) => over.or_else(|| base.cloned()),
    }
}

/// Parsed shard index document.
#[derive(Debug, Clone, Deserialize)]
pub struct ShardIndexDescriptor {
    /// Schema tag, must be `manifest-index-v1`.
    pub schema: String,
    /// Version of the manifest this index describes.
    pub manifest_version: u32,
    /// Identity bits used for sharding, `4..=12`.
    pub shard_bits: u32,
    /// Directory holding the shard files.
    pub shard_dir: String,
    /// Shard file extension, including the dot.
    pub shard_file_ext: String,
}

/// Expected shard index schema tag.
pub const SHARD_INDEX_SCHEMA: &str = "manifest-index-v1";

impl ShardIndexDescriptor {
    /// Validate the schema tag and shard bit width.
    pub fn validate(&self) -> Result<()> {
        if self.schema != SHARD_INDEX_SCHEMA {
            return Err(Error::InvalidData {
                context: "shard index",
                detail: format!("unknown schema {:?}", self.schema),
            });
        }
        if !(4..=12).contains(&self.shard_bits) {
            return Err(Error::InvalidData {
                context: "shard index",
                detail: format!("shard_bits {} outside 4..=12", self.shard_bits),
            });
        }
        Ok(())
    }

    /// Shard id for an identity: the low `shard_bits` bits.
    #[must_use]
    pub fn shard_of(&self, id: ArchetypeId) -> u32 {
        id.0 & ((1 << self.shard_bits) - 1)
    }

    /// Relative URL of a shard file: zero-padded lowercase hex under the
    /// shard directory.
    #[must_use]
    pub fn shard_url(&self, shard: u32) -> String {
        let width = (self.shard_bits as usize).div_ceil(4);
        format!(
            "{}/{shard:0width$x}{}",
            self.shard_dir, self.shard_file_ext
        )
    }
}

/// A shard file: a partial manifest merged into the live one.
#[derive(Debug, Clone, Deserialize)]
struct ShardFile {
    #[serde(default)]
    meshes: HashMap<String, ManifestEntry>,
}

/// Per-process merged manifest with lazy shard loading.
pub struct ManifestShardIndex<C: ByteCache> {
    fetcher: Arc<AssetFetcher<C>>,
    descriptor: ShardIndexDescriptor,
    state: Mutex<IndexState>,
    loads: InflightRegistry<u32, ()>,
    on_merge: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

#[derive(Default)]
struct IndexState {
    loaded: HashSet<u32>,
    meshes: HashMap<ArchetypeId, ManifestEntry>,
}

impl<C: ByteCache> ManifestShardIndex<C> {
    /// Create an index from a validated descriptor.
    pub fn new(fetcher: Arc<AssetFetcher<C>>, descriptor: ShardIndexDescriptor) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self {
            fetcher,
            descriptor,
            state: Mutex::new(IndexState::default()),
            loads: InflightRegistry::new(),
            on_merge: None,
        })
    }

    /// Register a callback invoked with the number of *new* entries after
    /// each merge.
    #[must_use]
    pub fn with_merge_callback(mut self, on_merge: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_merge = Some(Box::new(on_merge));
        self
    }

    /// The index descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &ShardIndexDescriptor {
        &self.descriptor
    }

    /// Number of entries in the live manifest.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().meshes.len()
    }

    /// Whether the live manifest is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an identity's data is present. A pure membership check; no
    /// geometry is touched.
    #[must_use]
    pub fn is_available(&self, id: ArchetypeId) -> bool {
        self.state.lock().unwrap().meshes.contains_key(&id)
    }

    /// Whether a shard has settled (successfully or not).
    #[must_use]
    pub fn is_shard_loaded(&self, shard: u32) -> bool {
        self.state.lock().unwrap().loaded.contains(&shard)
    }

    /// A clone of the entry for an identity, if its shard is loaded and the
    /// entry exists.
    #[must_use]
    pub fn entry(&self, id: ArchetypeId) -> Option<ManifestEntry> {
        self.state.lock().unwrap().meshes.get(&id).cloned()
    }

    /// Resolve an identity and LOD name to its effective submesh list,
    /// applying the LOD fallback chain.
    #[must_use]
    pub fn resolve(&self, id: ArchetypeId, lod: &str) -> Option<(String, Vec<Submesh>)> {
        let state = self.state.lock().unwrap();
        let entry = state.meshes.get(&id)?;
        entry
            .resolve_lod(lod)
            .map(|(name, submeshes)| (name.to_string(), submeshes.to_vec()))
    }

    /// Ensure the shard covering `id` is loaded.
    pub async fn prefetch(&self, id: ArchetypeId, priority: Priority) {
        self.prefetch_shard(self.descriptor.shard_of(id), priority)
            .await;
    }

    /// Ensure a shard is loaded. Fetches at most once; concurrent callers
    /// join the in-flight load. A failed fetch still marks the shard loaded.
    pub async fn prefetch_shard(&self, shard: u32, priority: Priority) {
        if self.is_shard_loaded(shard) {
            return;
        }
        self.loads
            .run_or_join(shard, || self.load_shard(shard, priority))
            .await;
    }

    /// Re-arm a shard for prefetch after a failed load.
    ///
    /// Already-merged entries are kept; a subsequent [`prefetch_shard`]
    /// fetches the shard again and merges only entries not yet present.
    ///
    /// [`prefetch_shard`]: ManifestShardIndex::prefetch_shard
    pub fn reset_shard(&self, shard: u32) {
        self.state.lock().unwrap().loaded.remove(&shard);
    }

    /// Merge a full (non-sharded) manifest document into the live map.
    ///
    /// Returns the number of new entries added.
    pub fn merge_manifest(&self, manifest: Manifest) -> usize {
        let added = self.merge_entries(manifest.meshes);
        self.notify_merge(added);
        added
    }

    async fn load_shard(&self, shard: u32, priority: Priority) {
        let url = self.descriptor.shard_url(shard);
        let added = match self.fetcher.fetch_json::<ShardFile>(&url, priority).await {
            Ok(file) => {
                let added = self.merge_entries(file.meshes);
                tracing::info!(shard, added, "merged shard");
                added
            }
            Err(e) => {
                // Marked loaded anyway: a bad shard means missing assets,
                // not a retry storm.
                tracing::warn!(shard, url = %url, error = %e, "shard load failed");
                0
            }
        };
        self.state.lock().unwrap().loaded.insert(shard);
        self.notify_merge(added);
    }

    /// Merge entries into the live map, normalizing identities and
    /// materials. Existing entries win; duplicates are not re-merged.
    fn merge_entries(&self, entries: HashMap<String, ManifestEntry>) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut added = 0;
        for (key, mut entry) in entries {
            let id = ArchetypeId::normalize(&key);
            if let std::collections::hash_map::Entry::Vacant(slot) = state.meshes.entry(id) {
                entry.normalize();
                slot.insert(entry);
                added += 1;
            }
        }
        added
    }

    fn notify_merge(&self, added: usize) {
        if let Some(on_merge) = &self.on_merge {
            on_merge(added);
        }
    }
}
