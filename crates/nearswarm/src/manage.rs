//! On-disk maintenance: installing plugin directories and editing the config file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nearswarm_models::descriptor::DESCRIPTOR_FILE;
use nearswarm_models::{env, AgentDescriptor, NearswarmConfig};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

fn plugin_path(plugins_dir: &Path, name: &str) -> Result<PathBuf, anyhow::Error> {
    if name.trim().is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        bail!("invalid plugin name {name:?}");
    }
    Ok(plugins_dir.join(name))
}

/// Parse `<source>/agent.yaml` so broken plugins never reach the plugin directory.
fn read_source_descriptor(source: &Path) -> Result<AgentDescriptor, anyhow::Error> {
    let path = source.join(DESCRIPTOR_FILE);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("{} has no readable {DESCRIPTOR_FILE}", source.display()))?;
    AgentDescriptor::from_yaml_str_with(&text, env::process_env)
        .with_context(|| format!("Invalid descriptor {}", path.display()))
}

fn copy_tree(source: &Path, target: &Path) -> Result<u64, anyhow::Error> {
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry.path().strip_prefix(source)?;
        let dest = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        } else {
            warn!(path = %entry.path().display(), "skipping symlink in plugin source");
        }
    }
    debug!(source = %source.display(), target = %target.display(), files = copied, "plugin tree copied");
    Ok(copied)
}

/// Copy a local plugin directory into `plugins_dir`.
///
/// The plugin is named after `name`, or after its descriptor when `name` is
/// `None`. An existing plugin of that name is never overwritten.
pub fn install_plugin(plugins_dir: &Path, source: &Path, name: Option<&str>) -> Result<PathBuf, anyhow::Error> {
    let descriptor = read_source_descriptor(source)?;
    let name = name.unwrap_or(&descriptor.name);
    let target = plugin_path(plugins_dir, name)?;
    if target.exists() {
        bail!("plugin {name} is already installed at {}", target.display());
    }

    let files = copy_tree(source, &target)?;
    info!(plugin = name, role = %descriptor.role, files, path = %target.display(), "plugin installed");
    Ok(target)
}

/// Replace an installed plugin with the contents of `source`.
///
/// The new tree is staged next to the old one first, so a failed copy leaves
/// the installed plugin untouched.
pub fn update_plugin(plugins_dir: &Path, name: &str, source: &Path) -> Result<PathBuf, anyhow::Error> {
    let target = plugin_path(plugins_dir, name)?;
    if !target.is_dir() {
        bail!("plugin {name} is not installed");
    }
    let descriptor = read_source_descriptor(source)?;

    let staging = plugins_dir.join(format!(".{name}.staging"));
    let retired = plugins_dir.join(format!(".{name}.old"));
    for leftover in [&staging, &retired] {
        if leftover.exists() {
            std::fs::remove_dir_all(leftover)
                .with_context(|| format!("Failed to clear {}", leftover.display()))?;
        }
    }

    if let Err(e) = copy_tree(source, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }
    std::fs::rename(&target, &retired).with_context(|| format!("Failed to move {}", target.display()))?;
    if let Err(e) = std::fs::rename(&staging, &target) {
        std::fs::rename(&retired, &target)
            .with_context(|| format!("Failed to restore {}", target.display()))?;
        return Err(e).with_context(|| format!("Failed to replace {}", target.display()));
    }
    std::fs::remove_dir_all(&retired).with_context(|| format!("Failed to remove {}", retired.display()))?;

    info!(plugin = name, version = %descriptor.version, "plugin updated");
    Ok(target)
}

pub fn remove_plugin(plugins_dir: &Path, name: &str) -> Result<PathBuf, anyhow::Error> {
    let target = plugin_path(plugins_dir, name)?;
    if !target.is_dir() {
        bail!("plugin {name} is not installed");
    }
    std::fs::remove_dir_all(&target).with_context(|| format!("Failed to remove {}", target.display()))?;
    info!(plugin = name, "plugin removed");
    Ok(target)
}

/// Read a command-line value as a TOML literal, or as a plain string when it is not one.
fn parse_value(raw: &str) -> toml::Value {
    format!("v = {raw}")
        .parse::<toml::Table>()
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn to_table(config: &NearswarmConfig) -> Result<toml::Table, anyhow::Error> {
    match toml::Value::try_from(config)? {
        toml::Value::Table(table) => Ok(table),
        other => bail!("config serialized to {}", other.type_str()),
    }
}

fn lookup<'a>(table: &'a toml::Table, path: &[&str]) -> Option<&'a toml::Value> {
    let (first, rest) = path.split_first()?;
    let value = table.get(*first)?;
    if rest.is_empty() {
        return Some(value);
    }
    lookup(value.as_table()?, rest)
}

/// Set `key` (dotted, e.g. `swarm.min_votes`) in the config file at `path`.
///
/// The file is created from defaults when absent. Unknown keys and values
/// that fail validation are rejected and leave the file unchanged. Comments
/// are not preserved.
pub fn set_config_value(path: &Path, key: &str, raw: &str) -> Result<toml::Value, anyhow::Error> {
    let segments: Vec<&str> = key.split('.').map(str::trim).collect();
    if segments.iter().any(|s| s.is_empty()) {
        bail!("invalid config key {key:?}");
    }

    let mut table: toml::Table = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?
            .parse()
            .with_context(|| format!("Failed to parse config: {}", path.display()))?
    } else {
        to_table(&NearswarmConfig::default())?
    };

    let value = parse_value(raw);
    let (leaf, parents) = segments.split_last().context("empty config key")?;
    let mut section = &mut table;
    for part in parents {
        section = section
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()))
            .as_table_mut()
            .with_context(|| format!("{part} in {key} is not a section"))?;
    }
    section.insert(leaf.to_string(), value.clone());

    let text = toml::to_string_pretty(&table)?;
    let config = NearswarmConfig::from_toml_str_with(&text, env::process_env)
        .with_context(|| format!("{key} = {raw} is not a valid setting"))?;
    // Keys the typed config does not know are dropped on the way through.
    let known = to_table(&config)?;
    if lookup(&known, &segments).is_none() {
        bail!("unknown config key {key}");
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))?;
    info!(key, path = %path.display(), "config updated");
    Ok(value)
}
