//! On-disk cache service (spec §4.8, component C8; design note in §9
//! "Process-wide mutable state").
//!
//! One process-wide reader/writer lock guards the whole cache
//! namespace, per spec §5's shared-resource policy ("the HTTP proxy
//! cache has one global reader/writer lock"). It is encapsulated here
//! as a plain service object rather than a module-level static, so it
//! can be constructed once by the engine and handed to every proxy
//! resource through `init`, and swapped for a per-path lock later
//! without touching callers.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::time::SystemTime;

use tokio::sync::RwLock;

use super::path::AbsoluteFile;

/// A cache hit: the full body plus the modification time to honour
/// `If-Modified-Since` against.
pub struct CachedFile {
    pub body: Vec<u8>,
    pub modified: SystemTime,
}

pub struct CacheService {
    lock: RwLock<()>,
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService {
    pub fn new() -> Self {
        Self { lock: RwLock::new(()) }
    }

    /// Reads `path` under the shared (reader) lock. `Ok(None)` is a
    /// cache miss; any other I/O error is surfaced (spec §4.8 step 2).
    pub async fn read(&self, path: &AbsoluteFile) -> io::Result<Option<CachedFile>> {
        let _guard = self.lock.read().await;

        let meta = match tokio::fs::metadata(path.as_str()).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let modified = meta.modified()?;

        match tokio::fs::read(path.as_str()).await {
            Ok(body) => Ok(Some(CachedFile { body, modified })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes `body` to `path` under the exclusive (writer) lock:
    /// `mkdir -p` the containing directory at mode 0700, write at mode
    /// 0600, and set the file's mtime to `modified` (spec §4.8 step
    /// 5). Written via a temp file plus rename so a concurrent reader
    /// never observes a partial file (spec §3's "never torn"
    /// invariant).
    pub async fn write(
        &self,
        dir: &super::path::AbsoluteDir,
        path: &AbsoluteFile,
        body: &[u8],
        modified: SystemTime,
    ) -> io::Result<()> {
        let _guard = self.lock.write().await;

        tokio::fs::create_dir_all(dir.as_str()).await?;
        tokio::fs::set_permissions(dir.as_str(), std::fs::Permissions::from_mode(0o700)).await?;

        let tmp_path = format!("{}.tmp.{}", path.as_str(), std::process::id());
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;

        let file = tokio::fs::File::open(&tmp_path).await?;
        let std_file = file.into_std().await;
        std_file.set_modified(modified)?;
        drop(std_file);

        tokio::fs::rename(&tmp_path, path.as_str()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpcache::path::AbsoluteDir;

    #[tokio::test]
    async fn miss_then_hit_round_trips_body_and_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AbsoluteDir::parse(&format!("{}/", tmp.path().join("x").to_str().unwrap())).unwrap();
        let file = AbsoluteFile::parse(&format!("{}y.tgz", dir.as_str())).unwrap();

        let service = CacheService::new();
        assert!(service.read(&file).await.unwrap().is_none());

        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        service.write(&dir, &file, b"hello", modified).await.unwrap();

        let hit = service.read(&file).await.unwrap().expect("cache hit");
        assert_eq!(hit.body, b"hello");
        assert_eq!(
            hit.modified.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs(),
            1_700_000_000
        );
    }
}
