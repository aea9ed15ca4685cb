//! Build context staging.
//!
//! The user crate usually lives in a workspace and depends on `modelserver`
//! by path, neither of which exists inside the image. The builder copies the
//! crate into a scratch directory, places the `modelserver` sources under
//! [`SDK_DIR`] and rewrites the copied manifest so it resolves on its own.
//! The user's files are never touched.

use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::debug;

use crate::error::{LocalModelError, Result};

/// Where the SDK lands inside the staged context.
pub const SDK_DIR: &str = ".cpr/modelserver";
pub const SDK_CRATE: &str = "modelserver";

const DEPENDENCY_SECTIONS: [&str; 3] = ["dependencies", "dev-dependencies", "build-dependencies"];
const SKIPPED_DIRS: [&str; 3] = ["target", ".git", ".cpr"];

const SDK_MANIFEST: &str = include_str!("../../modelserver/Cargo.toml");
const SDK_WORKSPACE_MANIFEST: &str = include_str!("../../../Cargo.toml");

const SDK_SOURCES: &[(&str, &str)] = &[
    ("src/lib.rs", include_str!("../../modelserver/src/lib.rs")),
    ("src/artifacts.rs", include_str!("../../modelserver/src/artifacts.rs")),
    ("src/config.rs", include_str!("../../modelserver/src/config.rs")),
    ("src/error.rs", include_str!("../../modelserver/src/error.rs")),
    ("src/handler.rs", include_str!("../../modelserver/src/handler.rs")),
    ("src/launch.rs", include_str!("../../modelserver/src/launch.rs")),
    ("src/predictor.rs", include_str!("../../modelserver/src/predictor.rs")),
    ("src/security.rs", include_str!("../../modelserver/src/security.rs")),
    ("src/serializer.rs", include_str!("../../modelserver/src/serializer.rs")),
    ("src/server.rs", include_str!("../../modelserver/src/server.rs")),
];

/// Copies `src` into `dest` and makes the copy buildable without its
/// workspace. Returns the rewritten manifest text.
pub fn stage(src: &Path, dest: &Path) -> Result<String> {
    let manifest_path = src.join("Cargo.toml");
    let manifest = std::fs::read_to_string(&manifest_path).map_err(|e| {
        LocalModelError::config(format!("cannot read {}: {e}", manifest_path.display()))
    })?;
    let workspace = find_workspace_manifest(src)?;

    copy_tree(src, dest)?;
    stage_sdk(&dest.join(SDK_DIR))?;

    let mut overrides = Table::new();
    overrides.insert(SDK_CRATE.to_string(), sdk_dependency());
    let standalone = standalone_manifest(&manifest, workspace.as_deref(), &overrides)?;
    std::fs::write(dest.join("Cargo.toml"), &standalone)?;
    debug!(context = %dest.display(), "build context staged");
    Ok(standalone)
}

/// Writes the embedded SDK crate with a manifest that needs no workspace.
pub fn stage_sdk(dest: &Path) -> Result<()> {
    for (path, body) in SDK_SOURCES {
        let target = dest.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, body)?;
    }
    std::fs::write(dest.join("Cargo.toml"), sdk_manifest()?)?;
    Ok(())
}

pub fn sdk_manifest() -> Result<String> {
    let mut doc = parse(SDK_MANIFEST, "modelserver manifest")?;
    doc.remove("dev-dependencies");
    let trimmed = toml::to_string(&doc)
        .map_err(|e| LocalModelError::config(format!("modelserver manifest: {e}")))?;
    standalone_manifest(&trimmed, Some(SDK_WORKSPACE_MANIFEST), &Table::new())
}

fn sdk_dependency() -> Value {
    let mut spec = Table::new();
    spec.insert("path".into(), Value::String(SDK_DIR.into()));
    Value::Table(spec)
}

/// Resolves every `workspace = true` key of `manifest` against `workspace`,
/// replaces the dependencies named in `overrides` and declares the crate its
/// own workspace root. Path dependencies that are not overridden are rejected
/// because they point outside the build context.
pub fn standalone_manifest(manifest: &str, workspace: Option<&str>, overrides: &Table) -> Result<String> {
    let mut doc = parse(manifest, "package manifest")?;
    let workspace = workspace.map(|w| parse(w, "workspace manifest")).transpose()?;
    let inherited = |key: &str| -> Option<Table> {
        workspace
            .as_ref()?
            .get("workspace")?
            .get(key)?
            .as_table()
            .cloned()
    };
    let ws_package = inherited("package").unwrap_or_default();
    let ws_dependencies = inherited("dependencies").unwrap_or_default();

    if let Some(package) = doc.get_mut("package").and_then(Value::as_table_mut) {
        for (key, value) in package.iter_mut() {
            if inherits(value) {
                *value = ws_package.get(key).cloned().ok_or_else(|| {
                    LocalModelError::config(format!(
                        "package.{key} inherits from a workspace that does not define it"
                    ))
                })?;
            }
        }
    }

    for section in DEPENDENCY_SECTIONS {
        if let Some(deps) = doc.get_mut(section).and_then(Value::as_table_mut) {
            rewrite_dependencies(deps, &ws_dependencies, overrides)?;
        }
    }
    if let Some(targets) = doc.get_mut("target").and_then(Value::as_table_mut) {
        for (_, target) in targets.iter_mut() {
            for section in DEPENDENCY_SECTIONS {
                if let Some(deps) = target.get_mut(section).and_then(Value::as_table_mut) {
                    rewrite_dependencies(deps, &ws_dependencies, overrides)?;
                }
            }
        }
    }

    if doc.get("lints").is_some_and(inherits) {
        doc.remove("lints");
    }
    doc.insert("workspace".into(), Value::Table(Table::new()));

    toml::to_string(&doc).map_err(|e| LocalModelError::config(format!("package manifest: {e}")))
}

fn rewrite_dependencies(deps: &mut Table, ws_dependencies: &Table, overrides: &Table) -> Result<()> {
    for (name, spec) in deps.iter_mut() {
        if let Some(replacement) = overrides.get(name) {
            *spec = merge_member_keys(as_dependency_table(replacement), spec);
            continue;
        }
        if inherits(spec) {
            let base = ws_dependencies.get(name).ok_or_else(|| {
                LocalModelError::config(format!(
                    "dependency {name} inherits from a workspace that does not declare it"
                ))
            })?;
            *spec = merge_member_keys(as_dependency_table(base), spec);
        }
        if spec.get("path").is_some() {
            return Err(LocalModelError::config(format!(
                "path dependency {name} is outside the build context"
            )));
        }
    }
    Ok(())
}

/// Member-side `features` add to the base list; `optional` is kept.
fn merge_member_keys(mut base: Table, member: &Value) -> Value {
    if let Some(extra) = member.get("features").and_then(Value::as_array) {
        let features = base
            .entry("features")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(list) = features.as_array_mut() {
            for feature in extra {
                if !list.contains(feature) {
                    list.push(feature.clone());
                }
            }
        }
    }
    if let Some(optional) = member.get("optional") {
        base.insert("optional".into(), optional.clone());
    }
    base.remove("workspace");
    Value::Table(base)
}

fn as_dependency_table(spec: &Value) -> Table {
    match spec {
        Value::String(version) => {
            let mut table = Table::new();
            table.insert("version".into(), Value::String(version.clone()));
            table
        }
        Value::Table(table) => table.clone(),
        _ => Table::new(),
    }
}

fn inherits(value: &Value) -> bool {
    value
        .get("workspace")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn parse(text: &str, what: &str) -> Result<Table> {
    text.parse::<Table>()
        .map_err(|e| LocalModelError::config(format!("{what}: {e}")))
}

/// Nearest ancestor of `src` (itself included) whose manifest has a
/// `[workspace]` table.
fn find_workspace_manifest(src: &Path) -> Result<Option<String>> {
    for dir in src.ancestors() {
        let path = dir.join("Cargo.toml");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        if parse(&text, "workspace manifest")?.contains_key("workspace") {
            debug!(manifest = %path.display(), "workspace root found");
            return Ok(Some(text));
        }
    }
    Ok(None)
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src_dir, dest_dir)) = pending.pop() {
        for entry in std::fs::read_dir(&src_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let target = dest_dir.join(&name);
            let kind = entry.file_type()?;
            if kind.is_dir() {
                if SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                    continue;
                }
                std::fs::create_dir_all(&target)?;
                pending.push((entry.path(), target));
            } else if kind.is_file() {
                std::fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(())
}
