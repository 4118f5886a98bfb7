//! Typed fetch operations over the scheduler, dedupe registry, and durable
//! byte cache.
//!
//! Every other subsystem fetches through [`AssetFetcher`]. An operation:
//!
//! 1. builds a dedupe key from its kind and URL and joins any identical
//!    in-flight request;
//! 2. on first caller, consults the durable byte cache, and on a miss takes
//!    a scheduler slot for the network fetch, storing the raw response back
//!    into the durable layer when the URL is cacheable;
//! 3. decodes the body per operation kind.
//!
//! Streamed variants deliver bytes to a caller-supplied callback as they
//! arrive instead of buffering the whole payload, so peak memory stays
//! bounded for very large responses. They read through the durable cache
//! (a hit is replayed in chunks) but never populate it. Chunk delivery is
//! bound to one caller's callback, so a concurrent identical stream cannot
//! join the first one; it is rejected with [`Error::AlreadyStreaming`]
//! instead of silently fetching the same URL twice.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;

use crate::cache::{ByteCache, NoCache, is_cacheable};
use crate::dedupe::InflightRegistry;
use crate::error::{Error, Result};
use crate::scheduler::{Priority, PriorityScheduler};

/// Chunk size used when replaying a durable-cache hit through a stream
/// callback.
const REPLAY_CHUNK_BYTES: usize = 64 * 1024;

/// Operation kind, part of the dedupe identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FetchKind {
    Json,
    Text,
    Binary,
    ByteStream,
    JsonLines,
}

/// Dedupe identity for a fetch operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FetchKey {
    kind: FetchKind,
    url: String,
}

/// Typed fetch facade for asset data.
///
/// Composes in-flight deduplication, priority scheduling, and the durable
/// byte cache behind JSON, text, binary, and streaming operations.
pub struct AssetFetcher<C: ByteCache = NoCache> {
    http: reqwest::Client,
    cache: Arc<C>,
    scheduler: PriorityScheduler,
    inflight: InflightRegistry<FetchKey, Result<Arc<Vec<u8>>>>,
    /// Keys of streams currently delivering to a callback.
    active_streams: Mutex<HashSet<FetchKey>>,
    base_url: String,
}

impl AssetFetcher<NoCache> {
    /// Create a fetcher with default settings and no durable caching.
    #[must_use]
    pub fn new(scheduler: PriorityScheduler) -> Self {
        Self::with_cache(scheduler, NoCache)
    }
}

impl<C: ByteCache> AssetFetcher<C> {
    /// Create a fetcher with a durable byte cache.
    #[must_use]
    pub fn with_cache(scheduler: PriorityScheduler, cache: C) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache: Arc::new(cache),
            scheduler,
            inflight: InflightRegistry::new(),
            active_streams: Mutex::new(HashSet::new()),
            base_url: String::new(),
        }
    }

    /// Set the base URL prepended to relative asset URLs. Should end with
    /// a `/`.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set a custom HTTP client.
    #[must_use]
    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// The scheduler this fetcher dispatches through, for runtime retuning.
    #[must_use]
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    /// The durable cache behind this fetcher.
    #[must_use]
    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Fetch and decode a JSON document.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str, priority: Priority) -> Result<T> {
        let data = self.fetch_raw(FetchKind::Json, url, priority).await?;
        serde_json::from_slice(&data).map_err(|e| Error::json("json payload", &e))
    }

    /// Fetch a plain-text document.
    pub async fn fetch_text(&self, url: &str, priority: Priority) -> Result<String> {
        let data = self.fetch_raw(FetchKind::Text, url, priority).await?;
        String::from_utf8(data.as_ref().clone()).map_err(|e| Error::InvalidData {
            context: "text payload",
            detail: e.to_string(),
        })
    }

    /// Fetch a binary payload.
    pub async fn fetch_bytes(&self, url: &str, priority: Priority) -> Result<Arc<Vec<u8>>> {
        self.fetch_raw(FetchKind::Binary, url, priority).await
    }

    /// Fetch a binary payload, opportunistically trying a `<url>.gz`
    /// compressed sidecar first.
    ///
    /// Any sidecar failure — absent companion, bad gzip stream — falls back
    /// silently to the uncompressed URL; it is never surfaced to the caller.
    pub async fn fetch_bytes_prefer_compressed(
        &self,
        url: &str,
        priority: Priority,
    ) -> Result<Arc<Vec<u8>>> {
        let sidecar = format!("{url}.gz");
        match self.fetch_raw(FetchKind::Binary, &sidecar, priority).await {
            Ok(compressed) => match gunzip(&compressed) {
                Ok(data) => return Ok(Arc::new(data)),
                Err(e) => {
                    tracing::debug!(url = %sidecar, error = %e, "sidecar decompression failed");
                }
            },
            Err(e) => {
                tracing::debug!(url = %sidecar, error = %e, "sidecar fetch failed");
            }
        }
        self.fetch_bytes(url, priority).await
    }

    /// Fetch a payload as a stream of byte chunks.
    ///
    /// `on_chunk` is invoked for each chunk as it arrives. A durable-cache
    /// hit is replayed through the callback in fixed-size chunks. A
    /// concurrent identical stream fails with [`Error::AlreadyStreaming`].
    pub async fn fetch_byte_stream<F>(&self, url: &str, priority: Priority, mut on_chunk: F) -> Result<()>
    where
        F: FnMut(&[u8]) + Send,
    {
        self.stream_url(FetchKind::ByteStream, url, priority, |chunk| {
            on_chunk(chunk);
            Ok(())
        })
        .await
    }

    /// Fetch a line-delimited-JSON payload, decoding records incrementally
    /// as bytes arrive.
    ///
    /// `on_record` is invoked once per complete line. Blank lines are
    /// skipped. The payload is never buffered in full; only the current
    /// partial line is carried between chunks.
    pub async fn fetch_json_lines<T, F>(&self, url: &str, priority: Priority, mut on_record: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(T) + Send,
    {
        let mut carry: Vec<u8> = Vec::new();
        self.stream_url(FetchKind::JsonLines, url, priority, |chunk| {
            carry.extend_from_slice(chunk);
            while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = carry.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if !line.iter().all(u8::is_ascii_whitespace) {
                    let record =
                        serde_json::from_slice(line).map_err(|e| Error::json("json line", &e))?;
                    on_record(record);
                }
            }
            Ok(())
        })
        .await?;

        if !carry.iter().all(u8::is_ascii_whitespace) {
            let record =
                serde_json::from_slice(&carry).map_err(|e| Error::json("json line", &e))?;
            on_record(record);
        }
        Ok(())
    }

    /// Deduplicated buffered fetch.
    async fn fetch_raw(
        &self,
        kind: FetchKind,
        url: &str,
        priority: Priority,
    ) -> Result<Arc<Vec<u8>>> {
        let key = FetchKey {
            kind,
            url: url.to_string(),
        };
        self.inflight
            .run_or_join(key, || self.load(url, priority))
            .await
    }

    /// First-caller path: durable cache, then a scheduled network fetch.
    async fn load(&self, url: &str, priority: Priority) -> Result<Arc<Vec<u8>>> {
        let cacheable = is_cacheable(url);
        if cacheable {
            match self.cache.get(url).await {
                Ok(Some(data)) => {
                    tracing::debug!(url, "durable cache hit");
                    return Ok(Arc::new(data));
                }
                Ok(None) => {}
                // Storage failures are a cache miss, never a fetch failure.
                Err(e) => tracing::warn!(url, error = %e, "durable cache read failed"),
            }
        }

        let data = self
            .scheduler
            .run(priority, self.fetch_network(url))
            .await?;

        if cacheable
            && let Err(e) = self.cache.put(url, data.clone()).await
        {
            tracing::warn!(url, error = %e, "durable cache store failed");
        }

        Ok(Arc::new(data))
    }

    /// Fetch raw bytes from the network.
    async fn fetch_network(&self, url: &str) -> Result<Vec<u8>> {
        let resolved = self.resolve_url(url);
        tracing::debug!(url = %resolved, "fetching");

        let response = self
            .http
            .get(&resolved)
            .send()
            .await
            .map_err(|e| Error::http(&resolved, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: resolved,
                status: status.as_u16(),
            });
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| Error::http(&resolved, &e))?;
        Ok(data.to_vec())
    }

    /// Streaming path shared by the byte-stream and json-lines operations.
    ///
    /// Streamed operations cannot join each other the way buffered fetches
    /// do — chunk delivery is bound to one caller's callback, and a joiner
    /// would be left with a settled result and no data. The dedupe key is
    /// still honored: a concurrent identical stream is rejected with a
    /// typed error before it can issue a duplicate network fetch.
    async fn stream_url<F>(
        &self,
        kind: FetchKind,
        url: &str,
        priority: Priority,
        mut on_chunk: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()> + Send,
    {
        if is_cacheable(url) {
            match self.cache.get(url).await {
                Ok(Some(data)) => {
                    tracing::debug!(url, "durable cache hit (stream replay)");
                    for chunk in data.chunks(REPLAY_CHUNK_BYTES) {
                        on_chunk(chunk)?;
                    }
                    return Ok(());
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(url, error = %e, "durable cache read failed"),
            }
        }

        let key = FetchKey {
            kind,
            url: url.to_string(),
        };
        if !self.active_streams.lock().unwrap().insert(key.clone()) {
            return Err(Error::AlreadyStreaming {
                url: url.to_string(),
            });
        }
        let _active = StreamGuard {
            streams: &self.active_streams,
            key,
        };

        let resolved = self.resolve_url(url);
        self.scheduler
            .run(priority, async {
                use futures_util::StreamExt;

                tracing::debug!(url = %resolved, "fetching (stream)");
                let response = self
                    .http
                    .get(&resolved)
                    .send()
                    .await
                    .map_err(|e| Error::http(&resolved, &e))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(Error::HttpStatus {
                        url: resolved.clone(),
                        status: status.as_u16(),
                    });
                }

                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| Error::http(&resolved, &e))?;
                    on_chunk(&chunk)?;
                }
                Ok(())
            })
            .await
    }

    /// Resolve a possibly-relative URL against the configured base.
    fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") || self.base_url.is_empty() {
            url.to_string()
        } else {
            format!("{}{url}", self.base_url)
        }
    }
}

/// Unregisters a stream key when the stream settles or is dropped.
struct StreamGuard<'a> {
    streams: &'a Mutex<HashSet<FetchKey>>,
    key: FetchKey,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.streams.lock().unwrap().remove(&self.key);
    }
}

/// Decompress a gzip payload.
fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::InvalidData {
            context: "gzip sidecar",
            detail: e.to_string(),
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryByteCache;
    use std::io::Write;

    fn fetcher_with_cache() -> AssetFetcher<MemoryByteCache> {
        AssetFetcher::with_cache(PriorityScheduler::new(4, 0.7), MemoryByteCache::new())
            .with_base_url("https://assets.example/tree/")
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_resolve_url() {
        let fetcher = fetcher_with_cache();
        assert_eq!(
            fetcher.resolve_url("meshes/a.bin"),
            "https://assets.example/tree/meshes/a.bin"
        );
        assert_eq!(
            fetcher.resolve_url("https://other.example/x"),
            "https://other.example/x"
        );
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[tokio::test]
    async fn test_bytes_served_from_durable_cache() {
        init_tracing();
        let fetcher = fetcher_with_cache();
        fetcher
            .cache()
            .put("meshes/a.bin", vec![1, 2, 3])
            .await
            .unwrap();

        let data = fetcher
            .fetch_bytes("meshes/a.bin", Priority::High)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), &vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_json_served_from_durable_cache() {
        let fetcher = fetcher_with_cache();
        fetcher
            .cache()
            .put("manifest.json", br#"{"version": 3}"#.to_vec())
            .await
            .unwrap();

        let value: serde_json::Value = fetcher
            .fetch_json("manifest.json", Priority::High)
            .await
            .unwrap();
        assert_eq!(value["version"], 3);
    }

    #[tokio::test]
    async fn test_malformed_json_is_typed_failure() {
        let fetcher = fetcher_with_cache();
        fetcher
            .cache()
            .put("manifest.json", b"not json".to_vec())
            .await
            .unwrap();

        let result: Result<serde_json::Value> =
            fetcher.fetch_json("manifest.json", Priority::High).await;
        assert!(matches!(result, Err(Error::Json { .. })));
    }

    #[tokio::test]
    async fn test_sidecar_preferred_when_present() {
        let fetcher = fetcher_with_cache();
        fetcher
            .cache()
            .put("meshes/a.bin.gz", gzip(b"mesh-bytes"))
            .await
            .unwrap();

        let data = fetcher
            .fetch_bytes_prefer_compressed("meshes/a.bin", Priority::Low)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"mesh-bytes");
    }

    #[tokio::test]
    async fn test_bad_sidecar_falls_back_silently() {
        let fetcher = fetcher_with_cache();
        // Sidecar present but not actually gzip.
        fetcher
            .cache()
            .put("meshes/a.bin.gz", b"garbage".to_vec())
            .await
            .unwrap();
        fetcher
            .cache()
            .put("meshes/a.bin", b"plain".to_vec())
            .await
            .unwrap();

        let data = fetcher
            .fetch_bytes_prefer_compressed("meshes/a.bin", Priority::Low)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"plain");
    }

    #[tokio::test]
    async fn test_stream_replays_cache_hit_in_chunks() {
        let fetcher = fetcher_with_cache();
        let payload = vec![7u8; REPLAY_CHUNK_BYTES + 10];
        fetcher
            .cache()
            .put("meshes/big.bin", payload.clone())
            .await
            .unwrap();

        let mut seen = Vec::new();
        let mut chunks = 0usize;
        fetcher
            .fetch_byte_stream("meshes/big.bin", Priority::Low, |chunk| {
                seen.extend_from_slice(chunk);
                chunks += 1;
            })
            .await
            .unwrap();
        assert_eq!(seen, payload);
        assert_eq!(chunks, 2);
    }

    #[tokio::test]
    async fn test_json_lines_incremental_parse() {
        let fetcher = fetcher_with_cache();
        fetcher
            .cache()
            .put(
                "records.ndjson",
                b"{\"n\": 1}\n\n{\"n\": 2}\n{\"n\": 3}".to_vec(),
            )
            .await
            .unwrap();

        let mut numbers = Vec::new();
        fetcher
            .fetch_json_lines("records.ndjson", Priority::Low, |record: serde_json::Value| {
                numbers.push(record["n"].as_i64().unwrap());
            })
            .await
            .unwrap();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrent_identical_streams_rejected() {
        let fetcher = fetcher_with_cache();
        // A stream for this URL is already delivering to a callback.
        fetcher.active_streams.lock().unwrap().insert(FetchKey {
            kind: FetchKind::ByteStream,
            url: "meshes/live.bin".to_string(),
        });

        let result = fetcher
            .fetch_byte_stream("meshes/live.bin", Priority::Low, |_| {})
            .await;
        assert!(matches!(result, Err(Error::AlreadyStreaming { .. })));
    }

    #[tokio::test]
    async fn test_stream_key_released_after_settlement() {
        // No base URL: the relative URL cannot resolve, so the network
        // attempt fails without leaving the process.
        let fetcher =
            AssetFetcher::with_cache(PriorityScheduler::new(2, 0.7), MemoryByteCache::new());

        let first = fetcher
            .fetch_byte_stream("missing.bin", Priority::Low, |_| {})
            .await;
        assert!(matches!(first, Err(Error::Http { .. })));
        assert!(fetcher.active_streams.lock().unwrap().is_empty());

        // A later retry is a fresh stream, not an in-progress rejection.
        let second = fetcher
            .fetch_byte_stream("missing.bin", Priority::Low, |_| {})
            .await;
        assert!(matches!(second, Err(Error::Http { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_collapse() {
        let fetcher = Arc::new(fetcher_with_cache());
        fetcher
            .cache()
            .put("meshes/a.bin", vec![5, 5, 5])
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let fetcher = Arc::clone(&fetcher);
            tasks.push(tokio::spawn(async move {
                fetcher.fetch_bytes("meshes/a.bin", Priority::High).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().as_ref(), &vec![5, 5, 5]);
        }
    }
}
