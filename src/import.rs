use std::path::{Path, PathBuf};

use log::debug;
use once_cell::sync::OnceCell;

use crate::error::{LoadError, VmError};
use crate::loader;
use crate::objects::Header;
use crate::value::Value;
use crate::vm::Vm;

#[cfg(unix)]
const LIB_EXTENSION: &str = "so";
#[cfg(target_os = "macos")]
const LIB_EXTENSION: &str = "dylib";
#[cfg(windows)]
const LIB_EXTENSION: &str = "dll";

/// Module path resolution and native-bridge loading, per §4.8. Keeps the
/// `entrypoint-relative import` and `stdlib-root-relative import` resolution
/// orders the original engine uses, translated from `dlopen`/`LoadLibrary`
/// candidate-path probing into a `libloading` equivalent.
pub struct Importer {
    entry_dir: String,
    stdlib_root: OnceCell<PathBuf>,
    libraries: Vec<libloading::Library>,
    cache: std::collections::HashMap<String, *mut Header>,
}

impl Importer {
    pub fn new(entry_dir: String) -> Self {
        Importer {
            entry_dir,
            stdlib_root: OnceCell::new(),
            libraries: Vec::new(),
            cache: std::collections::HashMap::new(),
        }
    }

    fn exe_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn expand_origin(raw: &str, exe_dir: &Path) -> String {
        raw.replace("$ORIGIN", &exe_dir.to_string_lossy())
    }

    /// Resolve the stdlib root once per process: a `meow-root` sidecar file
    /// next to the executable wins (with `$ORIGIN` expansion); otherwise the
    /// executable's directory, stripped of a trailing `bin` segment.
    fn stdlib_root(&self) -> &PathBuf {
        self.stdlib_root.get_or_init(|| {
            let exe_dir = Self::exe_dir();
            let config_file = exe_dir.join("meow-root");
            if let Ok(contents) = std::fs::read_to_string(&config_file) {
                let line = contents.lines().next().unwrap_or("").trim();
                if !line.is_empty() {
                    let expanded = Self::expand_origin(line, &exe_dir);
                    return std::fs::canonicalize(&expanded).unwrap_or_else(|_| PathBuf::from(expanded));
                }
            }
            if exe_dir.file_name().map(|n| n == "bin").unwrap_or(false) {
                exe_dir.parent().map(Path::to_path_buf).unwrap_or(exe_dir)
            } else {
                exe_dir
            }
        })
    }

    /// Resolve the importer-relative base directory §4.8 calls `baseDir`: the
    /// importing module's own directory, or the entry-point directory when
    /// there is no importing module (the entry itself, or a startup preload).
    fn base_dir(&self, importer_resolved_path: Option<&str>) -> PathBuf {
        match importer_resolved_path {
            Some(p) if p != self.entry_dir => Path::new(p).parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
            _ => PathBuf::from(&self.entry_dir),
        }
    }

    /// Probe the fixed candidate list the original resolver walks: the
    /// stdlib root itself, then `lib/`, `stdlib/`, `bin/stdlib/`, `bin/`,
    /// `../bin/stdlib/`, and finally `baseDir/` itself.
    fn resolve_library_path(&self, mod_path: &str, base_dir: &Path) -> Option<PathBuf> {
        let mut candidate = PathBuf::from(mod_path);
        if let Some(ext) = candidate.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            if ext == "meow" || ext == "meowb" {
                return None;
            }
        } else {
            candidate.set_extension(LIB_EXTENSION);
        }

        if candidate.is_absolute() && candidate.exists() {
            return std::fs::canonicalize(&candidate).ok();
        }

        let root = self.stdlib_root();
        for sub in ["", "lib", "stdlib", "bin/stdlib", "bin", "../bin/stdlib"] {
            let probe = if sub.is_empty() { root.join(&candidate) } else { root.join(sub).join(&candidate) };
            if probe.exists() {
                return std::fs::canonicalize(&probe).ok();
            }
        }

        let probe = base_dir.join(&candidate);
        if probe.exists() {
            return std::fs::canonicalize(&probe).ok();
        }
        None
    }

    /// Load a shared-library stdlib module by bare name (e.g. `"array"`),
    /// used both for `IMPORT_MODULE "array"` and for the `native`-module
    /// preload step at startup.
    pub fn load_shared_library(&mut self, vm: &mut Vm, name: &str) -> Result<*mut Header, VmError> {
        if let Some(&cached) = self.cache.get(name) {
            return Ok(cached);
        }
        let base_dir = self.base_dir(None);
        let lib_path = self
            .resolve_library_path(name, &base_dir)
            .ok_or_else(|| VmError::import(format!("no shared library found for module '{name}'")))?;
        self.load_library_at(vm, name, &lib_path)
    }

    fn load_library_at(&mut self, vm: &mut Vm, logical_name: &str, lib_path: &Path) -> Result<*mut Header, VmError> {
        let lib_path_str = lib_path.to_string_lossy().to_string();
        if let Some(&cached) = self.cache.get(&lib_path_str) {
            return Ok(cached);
        }
        type Factory = unsafe extern "C" fn(*mut Vm) -> *mut Header;
        let module = unsafe {
            let lib = libloading::Library::new(lib_path)
                .map_err(|e| VmError::import(format!("cannot load native library '{lib_path_str}': {e}")))?;
            let factory: libloading::Symbol<Factory> = lib
                .get(b"CreateMeowModule")
                .map_err(|e| VmError::import(format!("missing entry point 'CreateMeowModule' in '{lib_path_str}': {e}")))?;
            let module = factory(vm as *mut Vm);
            self.libraries.push(lib);
            module
        };
        self.cache.insert(logical_name.to_string(), module);
        self.cache.insert(lib_path_str, module);
        self.copy_native_globals(vm, module);
        Ok(module)
    }

    fn copy_native_globals(&self, vm: &mut Vm, module: *mut Header) {
        unsafe {
            let m = Header::as_module(module);
            let Some(m) = m else { return };
            if (*m).name == "native" {
                return;
            }
            let native_module = vm.native_module();
            if native_module.is_null() {
                return;
            }
            let Some(native) = Header::as_module(native_module) else { return };
            let pairs: Vec<(String, Value)> = (*native).globals.iter().map(|(k, v)| (k.clone(), *v)).collect();
            for (k, v) in pairs {
                (*m).globals.set(k, v);
            }
        }
    }

    /// `IMPORT_MODULE`'s full resolution: try the shared-library candidate
    /// paths first, then fall back to a scripted `.meow`/`.meowb` module
    /// resolved relative to the importing module's directory.
    pub fn resolve_and_load(&mut self, vm: &mut Vm, mod_path: &str, importer_resolved_path: &str) -> Result<*mut Header, VmError> {
        let base_dir = self.base_dir(Some(importer_resolved_path));
        if let Some(lib_path) = self.resolve_library_path(mod_path, &base_dir) {
            return self.load_library_at(vm, mod_path, &lib_path);
        }
        let is_binary = mod_path.ends_with(".meowb");
        self.load_scripted_module(vm, mod_path, is_binary, Some(importer_resolved_path))
            .map_err(|e| VmError::import(e.to_string()))
    }

    /// Load (or fetch from cache) a scripted module by source path, parse it
    /// with the textual or binary loader, and run its `@main` exactly once
    /// the first time it's imported (§4.8, §9).
    pub fn load_scripted_module(
        &mut self,
        vm: &mut Vm,
        mod_path: &str,
        is_binary: bool,
        importer_resolved_path: Option<&str>,
    ) -> Result<*mut Header, LoadError> {
        let base_dir = self.base_dir(importer_resolved_path);
        let resolved = base_dir.join(mod_path);
        let resolved = std::fs::canonicalize(&resolved).unwrap_or(resolved);
        let resolved_str = resolved.to_string_lossy().to_string();

        if let Some(&cached) = self.cache.get(&resolved_str) {
            return Ok(cached);
        }

        debug!("loading scripted module '{mod_path}' -> {resolved_str}");
        let protos = if is_binary {
            loader::binary::parse_file(&resolved, &mut vm.heap)?
        } else {
            loader::text::parse_file(&resolved, &mut vm.heap)?
        };

        let main_proto = protos
            .get("@main")
            .copied()
            .ok_or_else(|| LoadError::MissingMain { source_name: resolved_str.clone() })?;

        let module = vm.heap.alloc_module(mod_path.to_string(), resolved_str.clone());
        unsafe {
            let m = Header::as_module(module).unwrap();
            (*m).main_proto = Some(main_proto);
            (*m).is_binary = is_binary;
        }
        self.cache.insert(mod_path.to_string(), module);
        self.cache.insert(resolved_str, module);
        self.copy_native_globals(vm, module);

        Ok(module)
    }

    /// Run a scripted module's `@main` the first time it's seen, per §4.8/§9.
    /// A module already executing (import cycle) or already executed is a
    /// no-op - `@main` runs at most once regardless of how many places import it.
    pub fn ensure_executed(&self, vm: &mut Vm, module: *mut Header) -> Result<(), VmError> {
        let already_done = unsafe {
            let m = Header::as_module(module).unwrap();
            (*m).is_executed || (*m).is_executing
        };
        if already_done {
            return Ok(());
        }
        vm.run_module_main(module)
    }
}
