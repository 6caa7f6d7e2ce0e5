use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::GovConfig;
use crate::registry::Module;
use crate::store::STATE_DIR_NAME;
use crate::util;

static STATIC_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(?:import|export)\s+(?:type\s+)?[^'";]*?\bfrom\s+['"]([^'"]+)['"]"#)
        .expect("static import regex")
});
static BARE_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bimport\s+['"]([^'"]+)['"]"#).expect("bare import regex"));
static DYNAMIC_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(?:require|import)\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("dynamic import regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub rel: String,
    pub abs: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub line: usize,
    pub spec: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from_module: String,
    pub to_module: String,
    pub source_file: String,
    pub line: usize,
    pub import_path: String,
    pub resolved_path: String,
    pub violates: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    pub modules: Vec<String>,
    pub edges: Vec<Edge>,
}

/// Source files under `dir_rel`, sorted, skipping excluded directories and the
/// governance state directory.
pub fn walk_sources(root: &Path, dir_rel: &str, cfg: &GovConfig) -> Vec<SourceFile> {
    let start = if dir_rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(dir_rel)
    };
    if !start.exists() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let walker = WalkDir::new(&start).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        name != STATE_DIR_NAME && !cfg.exclude_dirs.iter().any(|d| *d == name)
    }) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!("walk {}: {err}", start.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if !cfg.source_extensions.iter().any(|e| e == ext) {
            continue;
        }
        out.push(SourceFile {
            rel: util::rel_posix(root, entry.path()),
            abs: entry.path().to_path_buf(),
        });
    }
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    out
}

/// Reads a candidate file; unreadable files are skipped by the caller.
pub fn read_text(file: &SourceFile) -> Option<String> {
    match std::fs::read(&file.abs) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) => {
            tracing::warn!(file = %file.rel, "skipping unreadable file: {err}");
            None
        }
    }
}

pub fn extract_imports(text: &str) -> Vec<ImportRef> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let mut specs: Vec<&str> = Vec::new();
        for re in [&*STATIC_IMPORT_RE, &*BARE_IMPORT_RE, &*DYNAMIC_IMPORT_RE] {
            for cap in re.captures_iter(line) {
                if let Some(m) = cap.get(1) {
                    if !specs.contains(&m.as_str()) {
                        specs.push(m.as_str());
                    }
                }
            }
        }
        out.extend(specs.into_iter().map(|spec| ImportRef {
            line: idx + 1,
            spec: spec.to_string(),
        }));
    }
    out
}

/// Resolves an import to `(owning module index, workspace-relative path)`.
/// Relative specifiers resolve against the importing file; bare specifiers
/// match a module name or root prefix. The longest matching root wins.
pub fn resolve(spec: &str, importer_rel: &str, modules: &[Module]) -> Option<(usize, String)> {
    let resolved = if is_relative(spec) {
        resolve_relative(spec, importer_rel)?
    } else {
        let bare = spec
            .strip_prefix("@/")
            .or_else(|| spec.strip_prefix("~/"))
            .unwrap_or(spec);
        match bare_to_path(bare, modules) {
            Some(p) => p,
            None => return None,
        }
    };

    modules
        .iter()
        .enumerate()
        .filter(|(_, m)| m.contains(&resolved))
        .max_by_key(|(_, m)| m.root.len())
        .map(|(i, _)| (i, resolved.clone()))
}

pub fn is_relative(spec: &str) -> bool {
    spec == "." || spec == ".." || spec.starts_with("./") || spec.starts_with("../")
}

/// Joins a relative specifier onto the importer's directory. `None` when the
/// result escapes the workspace root.
pub fn resolve_relative(spec: &str, importer_rel: &str) -> Option<String> {
    let dir = Path::new(importer_rel).parent().unwrap_or(Path::new(""));
    let joined = util::normalize_lexical(&dir.join(spec));
    let rel = joined.to_string_lossy().replace('\\', "/");
    if rel.starts_with("..") {
        return None;
    }
    Some(rel)
}

/// Workspace-relative target of an import, or the raw specifier for bare
/// imports (with `@/` and `~/` aliases stripped).
pub fn import_target(spec: &str, importer_rel: &str) -> String {
    if is_relative(spec) {
        resolve_relative(spec, importer_rel).unwrap_or_else(|| spec.to_string())
    } else {
        spec.strip_prefix("@/")
            .or_else(|| spec.strip_prefix("~/"))
            .unwrap_or(spec)
            .to_string()
    }
}

fn bare_to_path(bare: &str, modules: &[Module]) -> Option<String> {
    let mut best: Option<(usize, String)> = None;
    let unscoped = if bare.starts_with('@') {
        bare.split_once('/').map(|(_, rest)| rest).unwrap_or(bare)
    } else {
        bare
    };

    for m in modules {
        let mut consider = |key_len: usize, path: String| {
            if best.as_ref().map_or(true, |(len, _)| key_len > *len) {
                best = Some((key_len, path));
            }
        };
        for candidate in [bare, unscoped] {
            if candidate == m.name {
                consider(m.name.len(), m.root.clone());
            } else if let Some(rest) = candidate.strip_prefix(&format!("{}/", m.name)) {
                consider(m.name.len(), format!("{}/{rest}", m.root));
            }
        }
        if m.contains(bare) {
            consider(m.root.len(), bare.to_string());
        }
    }
    best.map(|(_, p)| p)
}

/// Builds the cross-module edge list for every registry module.
pub fn crawl(root: &Path, modules: &[Module], cfg: &GovConfig) -> DependencyGraph {
    let mut graph = DependencyGraph {
        modules: modules.iter().map(|m| m.name.clone()).collect(),
        edges: Vec::new(),
    };

    for (from_idx, module) in modules.iter().enumerate() {
        let files = walk_sources(root, &module.root, cfg);
        tracing::debug!(module = %module.name, files = files.len(), "crawl module");
        for file in files {
            let Some(text) = read_text(&file) else {
                continue;
            };
            for imp in extract_imports(&text) {
                let Some((to_idx, resolved)) = resolve(&imp.spec, &file.rel, modules) else {
                    continue;
                };
                if to_idx == from_idx {
                    continue;
                }
                graph.edges.push(Edge {
                    from_module: module.name.clone(),
                    to_module: modules[to_idx].name.clone(),
                    source_file: file.rel.clone(),
                    line: imp.line,
                    import_path: imp.spec,
                    resolved_path: resolved,
                    violates: false,
                    rule_id: None,
                });
            }
        }
    }

    graph.edges.sort_by(|a, b| {
        (a.source_file.as_str(), a.line, a.import_path.as_str())
            .cmp(&(b.source_file.as_str(), b.line, b.import_path.as_str()))
    });
    tracing::info!(edges = graph.edges.len(), "dependency graph built");
    graph
}
