// File: src/module.rs
//
// Module name resolution and the circular-import guard (spec.md §4.6).
// Grounded on the teacher's `ModuleLoader` (src/module.rs: search paths,
// loading stack, cache-by-name idiom), generalized to the `package.jsr` /
// `<name>.jsr` probing rules and `JSTARPATH` environment variable instead of
// the teacher's flat `.ruff` convention. Compiling and executing a resolved
// module's source happens in `vm::Vm::import_module`, which is the only
// place that also owns the heap the compiled module is allocated into; this
// type only resolves names to source text and guards against cycles.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Built-in module names recognised without touching the filesystem
/// (spec.md §6.3). Individual natives are registered by `builtins`; this
/// list only decides whether `IMPORT` should look on disk at all.
pub const BUILTIN_MODULES: &[&str] = &["__core__", "sys", "io", "math", "re", "debug"];

pub fn is_builtin_module(name: &str) -> bool {
    BUILTIN_MODULES.contains(&name)
}

pub struct ModuleLoader {
    search_paths: Vec<PathBuf>,
    /// Names currently being resolved, innermost last; a name reappearing
    /// here means a circular `import` (spec.md §4.6).
    loading_stack: Vec<String>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        let mut loader = ModuleLoader { search_paths: vec![PathBuf::from(".")], loading_stack: Vec::new() };
        loader.add_env_path();
        loader
    }

    /// Prepends `JSTARPATH` entries (spec.md §6.5), colon-separated on POSIX
    /// and semicolon-separated on Windows.
    fn add_env_path(&mut self) {
        let Ok(raw) = env::var("JSTARPATH") else { return };
        let sep = if cfg!(windows) { ';' } else { ':' };
        let mut prepended: Vec<PathBuf> = raw.split(sep).filter(|s| !s.is_empty()).map(PathBuf::from).collect();
        prepended.append(&mut self.search_paths);
        self.search_paths = prepended;
    }

    pub fn add_search_path<P: AsRef<Path>>(&mut self, path: P) {
        self.search_paths.push(path.as_ref().to_path_buf());
    }

    pub fn begin_loading(&mut self, name: &str) -> Result<(), String> {
        if self.loading_stack.iter().any(|n| n == name) {
            return Err(format!("circular import of module '{name}'"));
        }
        self.loading_stack.push(name.to_string());
        Ok(())
    }

    pub fn end_loading(&mut self, name: &str) {
        if self.loading_stack.last().map(String::as_str) == Some(name) {
            self.loading_stack.pop();
        }
    }

    /// Resolves a (possibly dotted) module name to source text by probing
    /// `path/<name-with-dots-as-/>/package.jsr` then `path/<name>.jsr` in
    /// every search path, plus a trailing `./` (spec.md §4.6 step 3).
    pub fn resolve(&self, name: &str) -> Option<(PathBuf, String)> {
        let as_dir = name.replace('.', "/");
        let mut paths = self.search_paths.clone();
        paths.push(PathBuf::from("./"));

        for base in &paths {
            let package = base.join(&as_dir).join("package.jsr");
            if let Ok(src) = fs::read_to_string(&package) {
                return Some((package, src));
            }
            let flat = base.join(format!("{as_dir}.jsr"));
            if let Ok(src) = fs::read_to_string(&flat) {
                return Some((flat, src));
            }
        }
        None
    }

    /// Leaf name used to bind a dotted import into its parent module's
    /// globals (spec.md §4.6 step 4): `a.b.c` binds under `c`.
    pub fn leaf_name(name: &str) -> &str {
        name.rsplit('.').next().unwrap_or(name)
    }

    /// Parent portion of a dotted name, if any: `a.b.c` -> `a.b`.
    pub fn parent_name(name: &str) -> Option<&str> {
        name.rfind('.').map(|i| &name[..i])
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}
