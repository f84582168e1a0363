//! Static file cache and watch invalidation
//!
//! Each worker keeps its own `relpath → entries` map of opened files.
//! Entries are immutable except for a metadata cell `(mtime, length)` that
//! a watcher thread refreshes through an atomic dirty flag; unlinking a
//! watched file marks the entry removed and the next lookup drops it from
//! the cache. Responses already in flight keep reading from the open
//! descriptor.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use log::{debug, error, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// Filesystem metadata snapshot served with the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub mtime: i64,
    pub length: u64,
}

fn read_meta(path: &Path) -> Option<FileMeta> {
    let md = std::fs::metadata(path).ok()?;
    let mtime = md
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    Some(FileMeta {
        mtime,
        length: md.len(),
    })
}

/// Written by the watcher thread, read by the worker.
#[derive(Debug)]
struct MetaCell {
    dirty: AtomicBool,
    removed: AtomicBool,
    pending: Mutex<FileMeta>,
}

type WatchRegistry = Arc<Mutex<HashMap<PathBuf, Arc<MetaCell>>>>;

/// One served file: its opened descriptor, MIME type, optional content
/// encoding peeled from a `.br`/`.gz` suffix, and watched metadata.
#[derive(Debug)]
pub struct FileEntry {
    path: PathBuf,
    relpath: String,
    file: File,
    mime: String,
    encoding: Option<&'static str>,
    current: Cell<FileMeta>,
    cell: Arc<MetaCell>,
}

impl FileEntry {
    fn open(path: PathBuf, root: &Path) -> Option<Self> {
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                debug!("failed to open file {}: {e}", path.display());
                return None;
            }
        };
        let meta = read_meta(&path)?;

        let rel = path.strip_prefix(root).ok()?;
        let mut relpath = format!("/{}", rel.to_string_lossy());

        let mut ext = ext_of(&relpath).to_string();
        let encoding = match ext.as_str() {
            "br" => Some("br"),
            "gz" | "gzip" => Some("gzip"),
            _ => None,
        };
        if encoding.is_some() {
            // index under the stripped name; MIME comes from the
            // underlying extension
            relpath.truncate(relpath.rfind('.').expect("suffix came from a dot"));
            ext = ext_of(&relpath).to_string();
        }
        let mime = mime_guess::from_ext(&ext)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string();

        Some(Self {
            path,
            relpath,
            file,
            mime,
            encoding,
            current: Cell::new(meta),
            cell: Arc::new(MetaCell {
                dirty: AtomicBool::new(false),
                removed: AtomicBool::new(false),
                pending: Mutex::new(meta),
            }),
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cache key: the request path this entry serves.
    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    pub fn mime_type(&self) -> &str {
        &self.mime
    }

    pub fn compressed(&self) -> bool {
        self.encoding.is_some()
    }

    pub fn encoding(&self) -> Option<&'static str> {
        self.encoding
    }

    /// Current `(mtime, length)`, swapping in the watcher's update when the
    /// dirty flag is set.
    pub fn info(&self) -> FileMeta {
        if self.cell.dirty.swap(false, Ordering::AcqRel) {
            if let Ok(pending) = self.cell.pending.lock() {
                self.current.set(*pending);
            }
        }
        self.current.get()
    }

    pub fn removed(&self) -> bool {
        self.cell.removed.load(Ordering::Acquire)
    }
}

fn ext_of(path: &str) -> &str {
    match path.rfind('.') {
        Some(at) => &path[at + 1..],
        None => "",
    }
}

/// Per-worker map of served files plus the watcher feeding their metadata
/// cells.
pub struct StaticFileCache {
    root: Option<PathBuf>,
    entries: HashMap<String, Vec<Rc<FileEntry>>>,
    registry: WatchRegistry,
    watcher: Option<RecommendedWatcher>,
}

impl StaticFileCache {
    pub fn new(root: Option<PathBuf>) -> Self {
        let registry: WatchRegistry = Arc::new(Mutex::new(HashMap::new()));
        let watcher = root.as_ref().and_then(|_| {
            let reg = Arc::clone(&registry);
            match notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                let Ok(event) = res else { return };
                let Ok(reg) = reg.lock() else { return };
                for path in &event.paths {
                    let Some(cell) = reg.get(path) else { continue };
                    match read_meta(path) {
                        Some(meta) => {
                            if let Ok(mut pending) = cell.pending.lock() {
                                *pending = meta;
                            }
                            cell.dirty.store(true, Ordering::Release);
                        }
                        None => cell.removed.store(true, Ordering::Release),
                    }
                }
            }) {
                Ok(w) => Some(w),
                Err(e) => {
                    error!("file watcher unavailable, static cache will not invalidate: {e}");
                    None
                }
            }
        });
        Self {
            root,
            entries: HashMap::new(),
            registry,
            watcher,
        }
    }

    /// Walks the static root and registers every regular file, the eager
    /// startup pass. Lazy registration in [`get`](StaticFileCache::get)
    /// covers files created later.
    pub fn scan(&mut self) {
        let Some(root) = self.root.clone() else { return };
        self.scan_dir(&root);
    }

    fn scan_dir(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("couldn't open directory {}: {e}", dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .map_or(true, |n| n.to_string_lossy().starts_with('.'))
            {
                continue;
            }
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => self.scan_dir(&path),
                Ok(ft) if ft.is_file() || ft.is_symlink() => {
                    self.register(path);
                }
                _ => {}
            }
        }
    }

    fn register(&mut self, path: PathBuf) -> Option<Rc<FileEntry>> {
        let root = self.root.as_deref()?;
        let entry = Rc::new(FileEntry::open(path, root)?);

        if let Some(watcher) = &mut self.watcher {
            if let Ok(mut reg) = self.registry.lock() {
                reg.insert(entry.path.clone(), Arc::clone(&entry.cell));
            }
            if let Err(e) = watcher.watch(&entry.path, RecursiveMode::NonRecursive) {
                debug!("watch failed for {}: {e}", entry.path.display());
            }
        }

        self.entries
            .entry(entry.relpath.clone())
            .or_default()
            .push(Rc::clone(&entry));
        Some(entry)
    }

    fn drop_entry(&mut self, entry: &Rc<FileEntry>) {
        if let Some(watcher) = &mut self.watcher {
            let _ = watcher.unwatch(&entry.path);
        }
        if let Ok(mut reg) = self.registry.lock() {
            reg.remove(&entry.path);
        }
    }

    /// Looks up `relpath` (leading `/`), preferring a pre-compressed
    /// variant when the client accepts one. Unknown paths are probed on
    /// disk, together with a speculative `.br` sibling.
    pub fn get(&mut self, relpath: &str, prefer_compressed: bool) -> Option<Rc<FileEntry>> {
        if relpath.contains("..") {
            return None;
        }

        // watcher-flagged removals take effect at lookup
        if let Some(list) = self.entries.get(relpath) {
            let stale: Vec<Rc<FileEntry>> = list.iter().filter(|e| e.removed()).cloned().collect();
            for entry in &stale {
                self.drop_entry(entry);
            }
            if !stale.is_empty() {
                if let Some(list) = self.entries.get_mut(relpath) {
                    list.retain(|e| !e.removed());
                    if list.is_empty() {
                        self.entries.remove(relpath);
                    }
                }
            }
        }

        if self.entries.get(relpath).map_or(true, |l| l.is_empty()) {
            let root = self.root.clone()?;
            let on_disk = root.join(relpath.trim_start_matches('/'));
            self.register(on_disk.clone());
            // speculative pre-compressed sibling
            let mut br = on_disk.into_os_string();
            br.push(".br");
            self.register(PathBuf::from(br));
        }

        let list = self.entries.get(relpath)?;
        if list.is_empty() {
            return None;
        }
        let pick = if prefer_compressed {
            list.iter().find(|e| e.compressed()).or_else(|| list.iter().find(|e| !e.compressed()))
        } else {
            list.iter().find(|e| !e.compressed()).or_else(|| list.iter().find(|e| e.compressed()))
        };
        pick.cloned()
    }
}

impl std::fmt::Debug for StaticFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFileCache")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{FileMeta, StaticFileCache};
    use std::fs;
    use std::sync::atomic::Ordering;

    fn fixture() -> (tempfile::TempDir, StaticFileCache) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"<html>plain</html>").unwrap();
        fs::write(dir.path().join("index.html.br"), b"brotli-bytes").unwrap();
        fs::write(dir.path().join("data.json"), b"{}").unwrap();
        let cache = StaticFileCache::new(Some(dir.path().to_path_buf()));
        (dir, cache)
    }

    #[test]
    fn compressed_variant_wins_when_requested() {
        let (_dir, mut cache) = fixture();
        let entry = cache.get("/index.html", true).unwrap();
        assert!(entry.compressed());
        assert_eq!(Some("br"), entry.encoding());
        assert_eq!("/index.html", entry.relpath());
        assert_eq!("text/html", entry.mime_type());
    }

    #[test]
    fn uncompressed_variant_wins_when_not_requested() {
        let (_dir, mut cache) = fixture();
        let entry = cache.get("/index.html", false).unwrap();
        assert!(!entry.compressed());
        assert_eq!(18, entry.info().length);
    }

    #[test]
    fn missing_files_are_none_and_dotdot_is_rejected() {
        let (_dir, mut cache) = fixture();
        assert!(cache.get("/nope.txt", true).is_none());
        assert!(cache.get("/../etc/passwd", true).is_none());
    }

    #[test]
    fn scan_registers_everything_up_front() {
        let (_dir, mut cache) = fixture();
        cache.scan();
        assert!(cache.entries.contains_key("/index.html"));
        assert!(cache.entries.contains_key("/data.json"));
        // both variants share the stripped key
        assert_eq!(2, cache.entries["/index.html"].len());
    }

    #[test]
    fn dirty_flag_swaps_in_new_metadata() {
        let (_dir, mut cache) = fixture();
        let entry = cache.get("/data.json", false).unwrap();
        let before = entry.info();

        let newer = FileMeta {
            mtime: before.mtime + 60,
            length: 999,
        };
        *entry.cell.pending.lock().unwrap() = newer;
        entry.cell.dirty.store(true, Ordering::Release);

        assert_eq!(newer, entry.info());
        // flag consumed; metadata stays
        assert_eq!(newer, entry.info());
    }

    #[test]
    fn removed_entries_disappear_at_next_lookup() {
        let (_dir, mut cache) = fixture();
        let entry = cache.get("/data.json", false).unwrap();
        entry.cell.removed.store(true, Ordering::Release);
        drop(entry);

        // the file is still on disk, so the lookup re-registers it fresh
        let again = cache.get("/data.json", false).unwrap();
        assert!(!again.removed());
    }
}
