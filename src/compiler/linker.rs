//! Module linker: include-DAG resolution
//!
//! Resolves `#include "path"` directives recursively, strips them from
//! the source, records them as dependency edges, and concatenates the
//! units in topological order. Cycles and self-includes are rejected.
//! Stripped text and dependency sets are cached per path across
//! compilations.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::error::{Error, Result};

/// Fetches raw source text for the linker
///
/// The VM supplies a reader backed by the virtual file system; tests
/// supply closures over in-memory maps.
pub trait SourceReader {
    /// Reads the full text at an absolute path
    fn read_source(&self, path: &str) -> Option<String>;
}

impl<F> SourceReader for F
where
    F: Fn(&str) -> Option<String>,
{
    fn read_source(&self, path: &str) -> Option<String> {
        self(path)
    }
}

/// One cached translation unit
#[derive(Debug, Clone)]
struct CachedUnit {
    /// Source text with include directives removed
    text: String,
    /// Absolute paths of direct dependencies
    deps: HashSet<String>,
}

/// Include resolver with a per-path cache
#[derive(Debug, Default)]
pub struct Linker {
    cache: HashMap<String, CachedUnit>,
}

impl Linker {
    /// Creates an empty linker
    pub fn new() -> Self {
        Linker::default()
    }

    /// Drops all cached units
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Resolves a possibly-bare include target to an absolute path
    ///
    /// Bare identifiers live under `/bin`; absolute paths are kept.
    pub fn resolve_name(name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/bin/{}", name)
        }
    }

    /// Links the unit at `entry`: loads every transitively included
    /// path, topologically sorts the dependency graph, and returns the
    /// concatenated source in dependency-first order.
    pub fn link(&mut self, entry: &str, reader: &dyn SourceReader) -> Result<String> {
        let entry = Self::resolve_name(entry);
        let order = self.topo_order(&entry, reader)?;
        debug!(entry = %entry, units = order.len(), "linked translation unit");
        let mut out = String::new();
        for path in &order {
            out.push_str(&self.cache[path].text);
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }

    /// Returns the topological order of `entry` and its dependencies,
    /// dependencies first
    pub fn topo_order(&mut self, entry: &str, reader: &dyn SourceReader) -> Result<Vec<String>> {
        let entry = Self::resolve_name(entry);
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([entry.clone()]);
        // Load every reachable unit into the cache
        while let Some(path) = queue.pop_front() {
            if !seen.insert(path.clone()) {
                continue;
            }
            if !self.cache.contains_key(&path) {
                let raw = reader
                    .read_source(&path)
                    .ok_or_else(|| Error::IncludeNotFound { path: path.clone() })?;
                let unit = Self::strip_includes(&path, &raw)?;
                self.cache.insert(path.clone(), unit);
            }
            for dep in &self.cache[&path].deps {
                queue.push_back(dep.clone());
            }
        }

        // Kahn's algorithm: repeatedly extract zero-in-degree units.
        // An edge dep -> includer means dep must appear first.
        let mut pending: HashMap<&str, usize> = seen
            .iter()
            .map(|p| (p.as_str(), self.cache[p].deps.len()))
            .collect();
        let mut order = Vec::with_capacity(seen.len());
        loop {
            let mut ready: Vec<&str> = pending
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&p, _)| p)
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_unstable();
            for path in ready {
                pending.remove(path);
                order.push(path.to_string());
                for p in pending.keys().copied().collect::<Vec<_>>() {
                    if self.cache[p].deps.contains(path) {
                        *pending.get_mut(p).unwrap() -= 1;
                    }
                }
            }
        }
        if !pending.is_empty() {
            let path = pending.keys().min().unwrap().to_string();
            return Err(Error::IncludeCycle { path });
        }
        Ok(order)
    }

    /// Removes include directives from `raw`, recording them as edges
    fn strip_includes(path: &str, raw: &str) -> Result<CachedUnit> {
        let mut text = String::with_capacity(raw.len());
        let mut deps = HashSet::new();
        for line in raw.lines() {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("#include") {
                let target = rest
                    .trim()
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .map(Self::resolve_name)
                    .ok_or_else(|| Error::IncludeNotFound {
                        path: rest.trim().to_string(),
                    })?;
                if target == path {
                    return Err(Error::SelfInclude {
                        path: path.to_string(),
                    });
                }
                deps.insert(target);
                // keep the line count stable for diagnostics
                text.push('\n');
            } else {
                text.push_str(line);
                text.push('\n');
            }
        }
        Ok(CachedUnit { text, deps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(files: &[(&str, &str)]) -> impl SourceReader {
        let map: HashMap<String, String> = files
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |path: &str| map.get(path).cloned()
    }

    #[test]
    fn test_topo_order_chain() {
        let r = reader(&[
            ("/bin/a", "#include \"/lib/b\"\nint a;\n"),
            ("/lib/b", "#include \"/lib/c\"\nint b;\n"),
            ("/lib/c", "int c;\n"),
        ]);
        let mut linker = Linker::new();
        let order = linker.topo_order("/bin/a", &r).unwrap();
        assert_eq!(order, vec!["/lib/c", "/lib/b", "/bin/a"]);
    }

    #[test]
    fn test_linearization_property() {
        // diamond: a -> {b, c}, b -> d, c -> d
        let r = reader(&[
            ("/bin/a", "#include \"b\"\n#include \"c\"\n"),
            ("/bin/b", "#include \"d\"\n"),
            ("/bin/c", "#include \"d\"\n"),
            ("/bin/d", "int d;\n"),
        ]);
        let mut linker = Linker::new();
        let order = linker.topo_order("/bin/a", &r).unwrap();
        let pos = |p: &str| order.iter().position(|o| o == p).unwrap();
        assert!(pos("/bin/d") < pos("/bin/b"));
        assert!(pos("/bin/d") < pos("/bin/c"));
        assert!(pos("/bin/b") < pos("/bin/a"));
        assert!(pos("/bin/c") < pos("/bin/a"));
    }

    #[test]
    fn test_cycle_rejected() {
        let r = reader(&[
            ("/bin/a", "#include \"/lib/b\"\n"),
            ("/lib/b", "#include \"/bin/a\"\n"),
        ]);
        let mut linker = Linker::new();
        assert!(matches!(
            linker.topo_order("/bin/a", &r),
            Err(Error::IncludeCycle { .. })
        ));
    }

    #[test]
    fn test_self_include_rejected() {
        let r = reader(&[("/bin/a", "#include \"/bin/a\"\n")]);
        let mut linker = Linker::new();
        assert!(matches!(
            linker.link("/bin/a", &r),
            Err(Error::SelfInclude { .. })
        ));
    }

    #[test]
    fn test_missing_include() {
        let r = reader(&[("/bin/a", "#include \"nope\"\n")]);
        let mut linker = Linker::new();
        assert!(matches!(
            linker.link("/bin/a", &r),
            Err(Error::IncludeNotFound { .. })
        ));
    }

    #[test]
    fn test_bare_name_resolution() {
        assert_eq!(Linker::resolve_name("io"), "/bin/io");
        assert_eq!(Linker::resolve_name("/bin/sh"), "/bin/sh");
    }

    #[test]
    fn test_directives_stripped_from_text() {
        let r = reader(&[
            ("/bin/a", "#include \"b\"\nint main() { return 0; }\n"),
            ("/bin/b", "int helper;\n"),
        ]);
        let mut linker = Linker::new();
        let text = linker.link("/bin/a", &r).unwrap();
        assert!(!text.contains("#include"));
        assert!(text.contains("int helper;"));
        assert!(text.contains("int main()"));
        // dependency text precedes the includer
        assert!(text.find("helper").unwrap() < text.find("main").unwrap());
    }
}
