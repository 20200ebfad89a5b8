// src/core/config_resolver.rs

use crate::constants::COMMANDLINE_BACKEND;
use crate::core::config_loader::{RawConfigSet, SourcedService};
use crate::core::env;
use crate::core::paths::{self, PathError};
use crate::models::{BackendDef, GroupDef, ServiceDefinition, platform_matches};
use crate::system::backend::{BackendError, BackendRegistry};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file '{}' (line {line}, char {column}): {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("import file not found: '{}'", .path.display())]
    MissingImport { path: PathBuf, importer: PathBuf },
    #[error("import cycle through '{}'", .path.display())]
    ImportCycle { path: PathBuf },
    #[error("{import} (imported from '{}'): {source}", .importer.display())]
    Import {
        import: String,
        importer: PathBuf,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("Duplicate name or alias: {}", .0.join(", "))]
    DuplicateName(Vec<String>),
    #[error("group cycle: {0}")]
    GroupCycle(String),
    #[error("A service or group could not be found for the following names: {}", .0.join(", "))]
    Unresolved(Vec<String>),
    #[error("Service '{service}' declares both a backend and commands/launch_checks.")]
    ConflictingBackend { service: String },
    #[error("Backend for service '{service}' could not be loaded: {source}")]
    Backend {
        service: String,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// --- RESOLVED GRAPH ---

/// Index of a group inside a [`ResolvedGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(usize);

/// A child of a group: a shared service, or another group by index.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupChild {
    Service(Arc<ServiceDefinition>),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub env: Vec<String>,
    /// Child names as declared, including platform-skipped ones.
    pub child_names: Vec<String>,
    /// Resolved children in declaration order.
    pub children: Vec<GroupChild>,
}

impl GroupDefinition {
    pub fn has_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    fn identifiers(&self) -> Vec<String> {
        let mut ids = self.aliases.clone();
        ids.push(self.name.clone());
        ids
    }

    fn child_groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.children.iter().filter_map(|c| match c {
            GroupChild::Group(id) => Some(*id),
            GroupChild::Service(_) => None,
        })
    }
}

/// Something a name or alias can refer to.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Service(&'a Arc<ServiceDefinition>),
    Group(&'a GroupDefinition),
}

impl Target<'_> {
    pub fn name(&self) -> &str {
        match self {
            Self::Service(s) => &s.name,
            Self::Group(g) => &g.name,
        }
    }
}

/// The validated service graph for one root config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedGraph {
    pub file_path: PathBuf,
    services: BTreeMap<String, Arc<ServiceDefinition>>,
    groups: Vec<GroupDefinition>,
    group_index: BTreeMap<String, GroupId>,
}

impl ResolvedGraph {
    /// Every service, keyed by name.
    pub fn service_map(&self) -> &BTreeMap<String, Arc<ServiceDefinition>> {
        &self.services
    }

    /// Every group, keyed by name.
    pub fn group_map(&self) -> BTreeMap<&str, &GroupDefinition> {
        self.groups.iter().map(|g| (g.name.as_str(), g)).collect()
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupDefinition> {
        self.groups.get(id.0)
    }

    /// Finds a service or group by name or alias. Names take precedence over aliases.
    pub fn lookup(&self, name: &str) -> Option<Target<'_>> {
        if let Some(service) = self.services.get(name) {
            return Some(Target::Service(service));
        }
        if let Some(group) = self.group_index.get(name).and_then(|id| self.group(*id)) {
            return Some(Target::Group(group));
        }
        if let Some(service) = self.services.values().find(|s| s.has_name(name)) {
            return Some(Target::Service(service));
        }
        self.groups.iter().find(|g| g.has_name(name)).map(Target::Group)
    }

    /// Every service reachable from `group`, depth-first, without duplicates.
    pub fn services_in(&self, group: &GroupDefinition) -> Vec<Arc<ServiceDefinition>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_services(group, &mut seen, &mut out);
        out
    }

    fn collect_services(
        &self,
        group: &GroupDefinition,
        seen: &mut HashSet<String>,
        out: &mut Vec<Arc<ServiceDefinition>>,
    ) {
        for child in &group.children {
            match child {
                GroupChild::Service(s) => {
                    if seen.insert(s.name.clone()) {
                        out.push(Arc::clone(s));
                    }
                }
                GroupChild::Group(id) => {
                    if let Some(g) = self.group(*id) {
                        self.collect_services(g, seen, out);
                    }
                }
            }
        }
    }
}

// --- RESOLUTION ---

/// Validates and links a loaded config set into a [`ResolvedGraph`].
///
/// Fails on a name or alias used twice, on a group cycle, and on any group child that names
/// neither a service nor a group. Children naming a service skipped for this platform are
/// dropped silently.
pub fn resolve(raw: &RawConfigSet, registry: &BackendRegistry) -> ConfigResult<ResolvedGraph> {
    let mut names_in_use: HashSet<String> = HashSet::new();
    let mut skipped: HashSet<String> = HashSet::new();
    let mut services: BTreeMap<String, Arc<ServiceDefinition>> = BTreeMap::new();

    for sourced in &raw.services {
        if !platform_matches(sourced.def.platform.as_deref(), std::env::consts::OS) {
            log::debug!(
                "Skipping service '{}' (platform '{}').",
                sourced.def.name,
                sourced.def.platform.as_deref().unwrap_or_default()
            );
            skipped.insert(sourced.def.name.clone());
            skipped.extend(sourced.def.aliases.iter().cloned());
            continue;
        }
        let service = build_service(sourced, raw, registry)?;
        claim_names(&mut names_in_use, service.identifiers())?;
        services.insert(service.name.clone(), Arc::new(service));
    }

    // Pass one: groups with their service children. Any other child is an orphan until a
    // group by that name turns up.
    let mut groups: Vec<GroupDefinition> = Vec::with_capacity(raw.groups.len());
    let mut group_index: BTreeMap<String, GroupId> = BTreeMap::new();
    let mut orphans: BTreeSet<String> = BTreeSet::new();

    for def in &raw.groups {
        let group = build_group(def, &raw.env);
        claim_names(&mut names_in_use, group.identifiers())?;
        for child in &group.child_names {
            if find_service(&services, child).is_none() && !skipped.contains(child) {
                orphans.insert(child.clone());
            }
        }
        group_index.insert(group.name.clone(), GroupId(groups.len()));
        groups.push(group);
    }

    // Pass two: link children in declaration order, rejecting cycles as links appear.
    for idx in 0..groups.len() {
        let child_names = groups
            .get(idx)
            .map(|g| g.child_names.clone())
            .unwrap_or_default();
        let mut children = Vec::with_capacity(child_names.len());
        for child in &child_names {
            if let Some(service) = find_service(&services, child) {
                children.push(GroupChild::Service(Arc::clone(service)));
            } else if let Some(id) = find_group(&groups, &group_index, child) {
                orphans.remove(child);
                children.push(GroupChild::Group(id));
            }
        }
        let id = GroupId(idx);
        let child_groups: Vec<GroupId> = children
            .iter()
            .filter_map(|c| match c {
                GroupChild::Group(g) => Some(*g),
                GroupChild::Service(_) => None,
            })
            .collect();
        if reaches(&groups, &child_groups, id) {
            let name = groups.get(idx).map(|g| g.name.clone()).unwrap_or_default();
            return Err(ConfigError::GroupCycle(name));
        }
        if let Some(group) = groups.get_mut(idx) {
            group.children = children;
        }
    }

    if !orphans.is_empty() {
        return Err(ConfigError::Unresolved(orphans.into_iter().collect()));
    }

    log::debug!(
        "Resolved {} services and {} groups from '{}'.",
        services.len(),
        groups.len(),
        raw.file_path.display()
    );
    Ok(ResolvedGraph {
        file_path: raw.file_path.clone(),
        services,
        groups,
        group_index,
    })
}

/// Finds a service by name, then by alias.
fn find_service<'a>(
    services: &'a BTreeMap<String, Arc<ServiceDefinition>>,
    name: &str,
) -> Option<&'a Arc<ServiceDefinition>> {
    services
        .get(name)
        .or_else(|| services.values().find(|s| s.has_name(name)))
}

fn find_group(
    groups: &[GroupDefinition],
    group_index: &BTreeMap<String, GroupId>,
    name: &str,
) -> Option<GroupId> {
    group_index.get(name).copied().or_else(|| {
        groups
            .iter()
            .position(|g| g.has_name(name))
            .map(GroupId)
    })
}

/// Reserves every identifier, failing with the sorted list of those already taken.
fn claim_names(names_in_use: &mut HashSet<String>, ids: Vec<String>) -> ConfigResult<()> {
    let mut taken: Vec<String> = ids
        .iter()
        .filter(|id| names_in_use.contains(*id))
        .cloned()
        .collect();
    if !taken.is_empty() {
        taken.sort();
        taken.dedup();
        return Err(ConfigError::DuplicateName(taken));
    }
    names_in_use.extend(ids);
    Ok(())
}

/// True if `target` is reachable from any of `from` through already-linked children.
fn reaches(groups: &[GroupDefinition], from: &[GroupId], target: GroupId) -> bool {
    let mut stack: Vec<GroupId> = from.to_vec();
    let mut visited = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !visited.insert(id) {
            continue;
        }
        if let Some(group) = groups.get(id.0) {
            stack.extend(group.child_groups());
        }
    }
    false
}

fn build_group(def: &GroupDef, shared_env: &[String]) -> GroupDefinition {
    GroupDefinition {
        name: def.name.clone(),
        aliases: def.aliases.clone(),
        description: def.description.clone(),
        env: env::merge_inherited(&def.env, shared_env),
        child_names: def.children.clone(),
        children: Vec::new(),
    }
}

fn build_service(
    sourced: &SourcedService,
    raw: &RawConfigSet,
    registry: &BackendRegistry,
) -> ConfigResult<ServiceDefinition> {
    let def = &sourced.def;
    let backend_spec = backend_spec_for(def)?;
    let backend = registry
        .load(&backend_spec)
        .map_err(|e| ConfigError::Backend {
            service: def.name.clone(),
            source: e,
        })?;
    let path = def
        .path
        .as_deref()
        .map(|p| paths::resolve_path(p, &sourced.base_dir))
        .transpose()?;

    Ok(ServiceDefinition {
        name: def.name.clone(),
        aliases: def.aliases.clone(),
        description: def.description.clone(),
        path,
        env: env::merge_inherited(&def.env, &raw.env),
        requires_sudo: def.requires_sudo,
        platform: def.platform.clone(),
        warmup: def.warmup.clone(),
        config_file: raw.file_path.clone(),
        backend_spec,
        backend,
    })
}

/// The explicit backend, or a command-line one built from the shorthand fields.
fn backend_spec_for(def: &crate::models::ServiceDef) -> ConfigResult<BackendDef> {
    let has_shorthand = def.commands.is_some() || def.launch_checks.is_some();
    match &def.backend {
        Some(_) if has_shorthand => Err(ConfigError::ConflictingBackend {
            service: def.name.clone(),
        }),
        Some(backend) => Ok(backend.clone()),
        None => {
            let mut config = serde_json::Map::new();
            if let Some(commands) = &def.commands {
                config.insert("commands".to_string(), commands.clone());
            }
            if let Some(checks) = &def.launch_checks {
                config.insert("launch_checks".to_string(), checks.clone());
            }
            Ok(BackendDef {
                kind: COMMANDLINE_BACKEND.to_string(),
                config,
            })
        }
    }
}
