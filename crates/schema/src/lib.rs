//! Process-wide registry of custom-resource selectable fields.
//!
//! Custom kinds register the JSONPath fields their field selectors may use.
//! The registry lives in memory for fast lookups and is mirrored to a JSON
//! file so registrations survive restarts.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use arc_swap::ArcSwapOption;
use metrics::gauge;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use tracing::{debug, error};

/// Environment variable overriding the on-disk mirror location.
pub const CRD_FILE_ENV: &str = "CUSTOM_RESOURCE_DEFINITION_METADATA_FILE";

const CRD_FILE_DEFAULT: &str = "./db/crds.json";

static CRD_FILE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var(CRD_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CRD_FILE_DEFAULT))
});

// Serializes file writes across concurrent register() calls.
static CRD_FILE_LOCK: Mutex<()> = Mutex::new(());

// Best-effort snapshot of the registered keys; stale reads are acceptable.
static CRD_KINDS: ArcSwapOption<Vec<String>> = ArcSwapOption::const_empty();

// In-memory map, loaded from the mirror file exactly once per process. An
// inoperable mirror is worse than crashing, so load failures are fatal.
static CRD_DEFS: Lazy<RwLock<FxHashMap<String, Vec<String>>>> = Lazy::new(|| {
    let mut map: FxHashMap<String, Vec<String>> = FxHashMap::default();
    if let Some(dir) = CRD_FILE.parent() {
        if !dir.as_os_str().is_empty() {
            if let Err(err) = create_dir_0700(dir) {
                error!(dir = %dir.display(), error = %err, "crd metadata directory creation failed");
                std::process::exit(1);
            }
        }
    }
    match fs::read(&*CRD_FILE) {
        Ok(bytes) => match serde_json::from_slice::<FxHashMap<String, Vec<String>>>(&bytes) {
            Ok(defs) => {
                debug!(kinds = defs.len(), file = %CRD_FILE.display(), "loaded crd metadata");
                map.extend(defs);
            }
            Err(err) => {
                error!(file = %CRD_FILE.display(), error = %err, "crd metadata file parse failed");
                std::process::exit(1);
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            error!(file = %CRD_FILE.display(), error = %err, "crd metadata file read failed");
            std::process::exit(1);
        }
    }
    RwLock::new(map)
});

/// Errors surfaced by [`register`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("custom resource definition parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("custom resource definition file write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// All registered registry keys (`"{version}.{group}/{plural}"`).
/// Iteration order is not stable; callers treat the result as a set.
pub fn all_kinds() -> Vec<String> {
    if let Some(kinds) = CRD_KINDS.load_full() {
        return (*kinds).clone();
    }
    let kinds: Vec<String> = CRD_DEFS.read().unwrap().keys().cloned().collect();
    CRD_KINDS.store(Some(Arc::new(kinds.clone())));
    kinds
}

/// Selectable field paths registered for a key, if any.
pub fn selectable_fields(key: &str) -> Option<Vec<String>> {
    CRD_DEFS.read().unwrap().get(key).cloned()
}

/// Register a raw CustomResourceDefinition payload.
///
/// Reads `spec.group`, `spec.names.plural`, and the top-level plus
/// per-version `selectableFields[*].jsonPath` entries (leading `.`
/// stripped). Every version that ends up with a non-empty field list gets a
/// `"{version}.{group}/{plural}"` entry; the last registration for a key
/// wins. When at least one version contributed, the whole map is rewritten
/// to the mirror file in a single write.
pub fn register(raw: &[u8]) -> Result<(), RegistryError> {
    let def: serde_json::Value = serde_json::from_slice(raw)?;
    let spec = def.get("spec");

    let group = spec
        .and_then(|s| s.get("group"))
        .and_then(|g| g.as_str())
        .unwrap_or("");
    let plural = spec
        .and_then(|s| s.get("names"))
        .and_then(|n| n.get("plural"))
        .and_then(|p| p.as_str())
        .unwrap_or("");

    let top_fields = json_paths(spec.and_then(|s| s.get("selectableFields")));

    // The file lock is only taken once a version actually contributes, and
    // is held until the mirror write below completes.
    let mut file_guard: Option<MutexGuard<'_, ()>> = None;
    let mut stored = false;

    let versions = spec
        .and_then(|s| s.get("versions"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for version in &versions {
        let mut fields = top_fields.clone();
        fields.extend(json_paths(version.get("selectableFields")));
        if fields.is_empty() {
            continue;
        }
        if file_guard.is_none() {
            file_guard = Some(CRD_FILE_LOCK.lock().unwrap_or_else(|e| e.into_inner()));
        }
        let name = version.get("name").and_then(|n| n.as_str()).unwrap_or("");
        CRD_DEFS
            .write()
            .unwrap()
            .insert(format!("{name}.{group}/{plural}"), fields);
        stored = true;
    }
    if !stored {
        return Ok(());
    }

    let defs = CRD_DEFS.read().unwrap();
    let kinds: Vec<String> = defs.keys().cloned().collect();
    let json = serde_json::to_vec(&*defs)?;
    drop(defs);

    gauge!("kinex_crd_kinds", kinds.len() as f64);
    CRD_KINDS.store(Some(Arc::new(kinds)));
    write_file_0600(&CRD_FILE, &json)?;
    Ok(())
}

/// Walk a dotted, wildcard-free path (`a.b.c` with optional single `[idx]`
/// per segment) through a JSON value.
pub fn eval_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        let (key, idx) = match seg.find('[') {
            Some(brk) => {
                let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
                let idx: usize = seg[brk + 1..end].parse().ok()?;
                (&seg[..brk], Some(idx))
            }
            None => (seg, None),
        };
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

fn json_paths(fields: Option<&serde_json::Value>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(arr) = fields.and_then(|f| f.as_array()) {
        for f in arr {
            if let Some(p) = f.get("jsonPath").and_then(|p| p.as_str()) {
                out.push(p.strip_prefix('.').unwrap_or(p).to_string());
            }
        }
    }
    out
}

#[cfg(unix)]
fn create_dir_0700(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_dir_0700(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_file_0600(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(data)
}

#[cfg(not(unix))]
fn write_file_0600(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}
