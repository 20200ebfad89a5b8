//! # Config Loader
//!
//! Reads a config file and, depth-first, every file it imports. The result is a flat,
//! ordered [`RawConfigSet`]: the root file's definitions first, then each import's (and
//! its own imports') in declaration order. Validation is left to the resolver.

use crate::core::config_resolver::{ConfigError, ConfigResult};
use crate::core::{env, paths};
use crate::models::{GroupDef, ProjectConfig, ServiceDef};
use std::fs;
use std::path::{Path, PathBuf};

/// A service definition together with where it was declared.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedService {
    pub def: ServiceDef,
    /// Directory of the declaring file; relative service paths are anchored here.
    pub base_dir: PathBuf,
}

/// Everything loaded for one root config, imports included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawConfigSet {
    /// The root config file.
    pub file_path: PathBuf,
    /// The root file's shared env, applied to every definition during resolution.
    pub env: Vec<String>,
    pub services: Vec<SourcedService>,
    pub groups: Vec<GroupDef>,
}

impl RawConfigSet {
    /// Builds a set from in-memory definitions, as if they came from `file_path`.
    pub fn from_definitions(
        file_path: impl Into<PathBuf>,
        services: Vec<ServiceDef>,
        groups: Vec<GroupDef>,
        env: Vec<String>,
    ) -> Self {
        let file_path = file_path.into();
        let base_dir = parent_dir(&file_path);
        Self {
            services: services
                .into_iter()
                .map(|def| SourcedService {
                    def,
                    base_dir: base_dir.clone(),
                })
                .collect(),
            groups,
            env,
            file_path,
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Loads `path` and all of its imports.
pub fn load_config(path: &Path) -> ConfigResult<RawConfigSet> {
    let file_path = dunce::canonicalize(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    log::debug!("Loading config from '{}'.", file_path.display());

    let config = read_config_file(&file_path)?;
    let mut set = RawConfigSet {
        file_path: file_path.clone(),
        env: config.env.clone(),
        services: Vec::new(),
        groups: Vec::new(),
    };
    let mut import_stack = vec![file_path.clone()];
    collect_definitions(config, &file_path, &mut set, &mut import_stack, true)?;

    log::debug!(
        "Config loaded with {} services and {} groups (imports included).",
        set.services.len(),
        set.groups.len()
    );
    Ok(set)
}

fn collect_definitions(
    config: ProjectConfig,
    file_path: &Path,
    set: &mut RawConfigSet,
    import_stack: &mut Vec<PathBuf>,
    is_root: bool,
) -> ConfigResult<()> {
    let base_dir = parent_dir(file_path);

    // The root file's env is applied by the resolver; imported files carry their own here.
    let file_env: &[String] = if is_root { &[] } else { &config.env };

    for mut def in config.services {
        def.env = env::merge_inherited(&def.env, file_env);
        set.services.push(SourcedService {
            def,
            base_dir: base_dir.clone(),
        });
    }
    for mut group in config.groups {
        group.env = env::merge_inherited(&group.env, file_env);
        set.groups.push(group);
    }

    for import in &config.imports {
        let import_path = paths::resolve_path(import, &base_dir)?;
        log::debug!("Loading import '{}'.", import_path.display());

        let loaded = load_import(&import_path, file_path, import_stack).and_then(|imported| {
            import_stack.push(import_path.clone());
            let result = collect_definitions(imported, &import_path, set, import_stack, false);
            import_stack.pop();
            result
        });
        loaded.map_err(|e| ConfigError::Import {
            import: import.clone(),
            importer: file_path.to_path_buf(),
            source: Box::new(e),
        })?;
    }
    Ok(())
}

fn load_import(
    import_path: &Path,
    importer: &Path,
    import_stack: &[PathBuf],
) -> ConfigResult<ProjectConfig> {
    if !import_path.is_file() {
        return Err(ConfigError::MissingImport {
            path: import_path.to_path_buf(),
            importer: importer.to_path_buf(),
        });
    }
    if import_stack.iter().any(|p| p == import_path) {
        return Err(ConfigError::ImportCycle {
            path: import_path.to_path_buf(),
        });
    }
    read_config_file(import_path)
}

/// Reads and parses one config file, choosing the format by extension.
pub fn read_config_file(path: &Path) -> ConfigResult<ProjectConfig> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(&content, path)
}

/// Parses config content. `.toml` files are TOML, everything else is JSON.
pub fn parse_config(content: &str, path: &Path) -> ConfigResult<ProjectConfig> {
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(content).map_err(|e| {
            let (line, column) = e
                .span()
                .map_or((0, 0), |span| line_and_char(content, span.start));
            ConfigError::Parse {
                path: path.to_path_buf(),
                line,
                column,
                message: e.message().to_string(),
            }
        })
    } else {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })
    }
}

/// Converts a byte offset into a 1-based (line, character) position.
fn line_and_char(content: &str, offset: usize) -> (usize, usize) {
    let before = content.get(..offset).unwrap_or(content);
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before.get(line_start..).map_or(0, |s| s.chars().count()) + 1;
    (line, column)
}
