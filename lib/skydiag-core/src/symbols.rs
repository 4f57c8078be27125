//! PDB symbol resolution for the stackwalk.
//!
//! The session resolves a symbol search path (explicit env var, then the
//! platform-standard `_NT_SYMBOL_PATH`, then a per-user cache directory,
//! optionally extended with a public symbol server when online usage is
//! permitted), then loads PDBs for the dump's modules. PDBs are located by
//! the CodeView GUID+age record embedded in the dump, searched in local
//! directories first and downloaded into the cache as a last resort.
//!
//! Only one symbol session may be active per process; creation serializes
//! on a process-wide lock which is held for the session's lifetime.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use pdb::{FallibleIterator, PDB};
use tracing::{debug, warn};

use crate::minidump::CodeViewPdbRecord;
use crate::{DiagError, Result};

const DEFAULT_SYMBOL_SERVER: &str = "https://msdl.microsoft.com/download/symbols";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

static SESSION_LOCK: Mutex<()> = Mutex::new(());

/// Identifies one dump module for symbol loading.
#[derive(Debug, Clone)]
pub struct ModuleSymbolInfo {
    pub filename: String,
    pub base: u64,
    pub end: u64,
    pub pdb_record: Option<CodeViewPdbRecord>,
}

/// A symbol resolved for one program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    pub displacement: u64,
}

/// Function symbols of one module, sorted by RVA for binary search.
struct ModuleSymbols {
    functions: Vec<(u32, String)>,
}

impl ModuleSymbols {
    /// Largest function RVA at or below the target.
    fn lookup(&self, rva: u32) -> Option<(&str, u32)> {
        match self.functions.binary_search_by_key(&rva, |(addr, _)| *addr) {
            Ok(idx) => Some((&self.functions[idx].1, 0)),
            Err(0) => None,
            Err(idx) => {
                let (fn_rva, name) = &self.functions[idx - 1];
                Some((name, rva - fn_rva))
            }
        }
    }
}

struct LoadedModule {
    base: u64,
    end: u64,
    key: String,
}

/// Scoped symbol session. Native/file resources and the process-wide lock
/// are released on drop, on all exit paths.
pub struct SymbolSession {
    _guard: MutexGuard<'static, ()>,
    pub search_path: String,
    pub cache_path: PathBuf,
    pub online_allowed: bool,
    pub online_used: bool,
    symbols_by_key: HashMap<String, ModuleSymbols>,
    loaded: Vec<LoadedModule>,
}

impl SymbolSession {
    /// Resolves the search path and loads symbols for every module.
    ///
    /// # Errors
    ///
    /// Returns `DiagError::SymInit` when no usable search path can be
    /// resolved (no env override and the cache directory cannot be
    /// created). Callers degrade to address-only stackwalks.
    pub fn initialize(modules: &[ModuleSymbolInfo], allow_online: bool) -> Result<Self> {
        let guard = SESSION_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let (search_path, cache_path) = resolve_search_path(allow_online)?;
        let online_used = search_path.contains("https://");
        debug!("symbol search path: {search_path}");

        let mut session = Self {
            _guard: guard,
            search_path,
            cache_path,
            online_allowed: allow_online,
            online_used,
            symbols_by_key: HashMap::new(),
            loaded: Vec::new(),
        };

        let client = if allow_online && session.online_used {
            reqwest::blocking::Client::builder()
                .timeout(DOWNLOAD_TIMEOUT)
                .build()
                .ok()
        } else {
            None
        };

        for m in modules {
            if m.base == 0 || m.end <= m.base {
                continue;
            }
            let key = module_key(&m.filename);
            if key.is_empty() {
                continue;
            }
            session.loaded.push(LoadedModule {
                base: m.base,
                end: m.end,
                key: key.clone(),
            });
            if session.symbols_by_key.contains_key(&key) {
                continue;
            }
            let Some(record) = &m.pdb_record else {
                continue;
            };
            if let Some(pdb_path) = session.locate_pdb(record, client.as_ref()) {
                match load_pdb_symbols(&pdb_path) {
                    Ok(symbols) => {
                        debug!(
                            "loaded {} symbols for {} from {:?}",
                            symbols.functions.len(),
                            m.filename,
                            pdb_path
                        );
                        session.symbols_by_key.insert(key, symbols);
                    }
                    Err(err) => debug!("failed to parse PDB {:?}: {}", pdb_path, err),
                }
            }
        }

        Ok(session)
    }

    /// Number of modules with loaded symbols.
    pub fn symbolized_module_count(&self) -> usize {
        self.symbols_by_key.len()
    }

    /// Resolves an absolute address to `symbol + displacement` when the
    /// containing module has symbols.
    pub fn resolve(&self, addr: u64) -> Option<ResolvedSymbol> {
        let module = self
            .loaded
            .iter()
            .find(|m| addr >= m.base && addr < m.end)?;
        let rva = u32::try_from(addr - module.base).ok()?;
        let symbols = self.symbols_by_key.get(&module.key)?;
        let (name, displacement) = symbols.lookup(rva)?;
        Some(ResolvedSymbol {
            name: name.to_string(),
            displacement: u64::from(displacement),
        })
    }

    /// Search order: local search-path directories, the symbol-server
    /// cache layout, then an online download into the cache.
    fn locate_pdb(
        &self,
        record: &CodeViewPdbRecord,
        client: Option<&reqwest::blocking::Client>,
    ) -> Option<PathBuf> {
        let pdb_name = Path::new(&record.pdb_name.replace('\\', "/"))
            .file_name()?
            .to_string_lossy()
            .into_owned();

        for dir in local_search_dirs(&self.search_path, &self.cache_path) {
            let flat = dir.join(&pdb_name);
            if flat.is_file() {
                return Some(flat);
            }
            let store = dir.join(&pdb_name).join(record.symbol_id()).join(&pdb_name);
            if store.is_file() {
                return Some(store);
            }
        }

        let client = client?;
        let server = online_server_url(&self.search_path)?;
        let url = format!("{}/{}/{}/{}", server, pdb_name, record.symbol_id(), pdb_name);
        let target = self
            .cache_path
            .join(&pdb_name)
            .join(record.symbol_id())
            .join(&pdb_name);
        match download_to(client, &url, &target) {
            Ok(()) => Some(target),
            Err(err) => {
                debug!("symbol download failed for {url}: {err}");
                None
            }
        }
    }
}

fn module_key(filename: &str) -> String {
    let stem = filename.rsplit_once('.').map_or(filename, |(s, _)| s);
    stem.to_lowercase()
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Per-user cache directory, created if missing.
fn resolve_cache_dir() -> Option<PathBuf> {
    let dir = match env_non_empty("SKYRIMDIAG_SYMBOL_CACHE_DIR") {
        Some(p) => PathBuf::from(p),
        None => dirs::cache_dir()?.join("SkyrimDiag").join("SymbolCache"),
    };
    if let Err(err) = std::fs::create_dir_all(&dir) {
        warn!("cannot create symbol cache {:?}: {}", dir, err);
        return None;
    }
    Some(dir)
}

fn resolve_search_path(allow_online: bool) -> Result<(String, PathBuf)> {
    if let Some(explicit) = env_non_empty("SKYRIMDIAG_SYMBOL_PATH") {
        let cache = resolve_cache_dir().unwrap_or_default();
        return Ok((explicit, cache));
    }
    if let Some(nt) = env_non_empty("_NT_SYMBOL_PATH") {
        let cache = resolve_cache_dir().unwrap_or_default();
        return Ok((nt, cache));
    }
    let cache = resolve_cache_dir()
        .ok_or_else(|| DiagError::SymInit("no symbol cache directory available".into()))?;
    let cache_str = cache.to_string_lossy().into_owned();
    let path = if allow_online {
        format!("srv*{cache_str}*{DEFAULT_SYMBOL_SERVER}")
    } else {
        cache_str
    };
    Ok((path, cache))
}

/// Plain directories mentioned in the search path, plus the cache itself.
fn local_search_dirs(search_path: &str, cache_path: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for element in search_path.split(';') {
        let element = element.trim();
        if element.is_empty() {
            continue;
        }
        if let Some(rest) = element.strip_prefix("srv*").or_else(|| element.strip_prefix("SRV*")) {
            // srv*<cache>*<server>: the cache component is a local dir.
            if let Some(cache) = rest.split('*').next() {
                if !cache.is_empty() && !cache.starts_with("http") {
                    dirs.push(PathBuf::from(cache));
                }
            }
            continue;
        }
        if !element.starts_with("http") {
            dirs.push(PathBuf::from(element));
        }
    }
    if !cache_path.as_os_str().is_empty() && !dirs.iter().any(|d| d == cache_path) {
        dirs.push(cache_path.to_path_buf());
    }
    dirs
}

fn online_server_url(search_path: &str) -> Option<String> {
    for element in search_path.split(';') {
        if let Some(pos) = element.find("http") {
            let url = element[pos..].trim_end_matches('*');
            if !url.is_empty() {
                return Some(url.trim_end_matches('/').to_string());
            }
        }
    }
    None
}

fn download_to(
    client: &reqwest::blocking::Client,
    url: &str,
    target: &Path,
) -> std::result::Result<(), String> {
    let resp = client.get(url).send().map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }
    let bytes = resp.bytes().map_err(|e| e.to_string())?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(target, &bytes).map_err(|e| e.to_string())
}

/// Extracts public function symbols from a PDB, sorted by RVA.
fn load_pdb_symbols(pdb_path: &Path) -> std::result::Result<ModuleSymbols, String> {
    let file = File::open(pdb_path).map_err(|e| format!("open failed: {e}"))?;
    let mut pdb = PDB::open(BufReader::new(file)).map_err(|e| format!("parse failed: {e}"))?;

    let symbol_table = pdb.global_symbols().map_err(|e| e.to_string())?;
    let address_map = pdb.address_map().map_err(|e| e.to_string())?;

    let mut functions = Vec::new();
    let mut symbols = symbol_table.iter();
    while let Some(symbol) = symbols.next().map_err(|e| e.to_string())? {
        if let Ok(pdb::SymbolData::Public(data)) = symbol.parse() {
            if let Some(rva) = data.offset.to_rva(&address_map) {
                functions.push((rva.0, data.name.to_string().into_owned()));
            }
        }
    }
    functions.sort_by_key(|(addr, _)| *addr);
    functions.dedup_by_key(|(addr, _)| *addr);
    Ok(ModuleSymbols { functions })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_key_strips_extension_and_case() {
        assert_eq!(module_key("HdtSMP64.dll"), "hdtsmp64");
        assert_eq!(module_key("SkyrimSE.exe"), "skyrimse");
        assert_eq!(module_key("noext"), "noext");
    }

    #[test]
    fn symbol_lookup_uses_predecessor() {
        let syms = ModuleSymbols {
            functions: vec![(0x100, "Alpha".into()), (0x200, "Beta".into())],
        };
        assert_eq!(syms.lookup(0x0FF), None);
        assert_eq!(syms.lookup(0x100), Some(("Alpha", 0)));
        assert_eq!(syms.lookup(0x1FF), Some(("Alpha", 0xFF)));
        assert_eq!(syms.lookup(0x250), Some(("Beta", 0x50)));
    }

    #[test]
    fn search_dirs_from_srv_path() {
        let dirs = local_search_dirs(
            "srv*C:\\symcache*https://msdl.microsoft.com/download/symbols;D:\\pdbs",
            Path::new("C:\\symcache"),
        );
        assert_eq!(dirs, vec![PathBuf::from("C:\\symcache"), PathBuf::from("D:\\pdbs")]);
    }

    #[test]
    fn server_url_extraction() {
        assert_eq!(
            online_server_url("srv*/tmp/cache*https://msdl.microsoft.com/download/symbols"),
            Some("https://msdl.microsoft.com/download/symbols".to_string())
        );
        assert_eq!(online_server_url("/tmp/cache"), None);
    }

    #[test]
    fn symbol_id_format() {
        let record = CodeViewPdbRecord {
            guid: [
                0x78, 0x56, 0x34, 0x12, 0xBC, 0x9A, 0xF0, 0xDE, 0x01, 0x23, 0x45, 0x67, 0x89,
                0xAB, 0xCD, 0xEF,
            ],
            age: 2,
            pdb_name: "game.pdb".into(),
        };
        assert_eq!(record.symbol_id(), "123456789ABCDEF00123456789ABCDEF2");
    }

    #[test]
    fn session_resolves_nothing_without_pdbs() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SKYRIMDIAG_SYMBOL_CACHE_DIR", dir.path());
        let modules = vec![ModuleSymbolInfo {
            filename: "test.dll".into(),
            base: 0x1000,
            end: 0x2000,
            pdb_record: None,
        }];
        let session = SymbolSession::initialize(&modules, false).unwrap();
        assert_eq!(session.symbolized_module_count(), 0);
        assert!(session.resolve(0x1800).is_none());
        assert!(!session.online_used);
        std::env::remove_var("SKYRIMDIAG_SYMBOL_CACHE_DIR");
    }
}
