use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _, Result};
use serde::{Deserialize, Serialize};

/// `stratactl` client configuration, stored as YAML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    #[serde(default)]
    pub current_context: String,
    #[serde(default)]
    pub contexts: Vec<CliContext>,
}

/// One server the CLI can talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliContext {
    pub name: String,
    pub url: String,
    /// Credential sent as `Authorization`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// `$STRATA_CONFIG`, else `~/.strata/config.yaml`.
pub fn default_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os("STRATA_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set; pass --config or set STRATA_CONFIG"))?;
    Ok(PathBuf::from(home).join(".strata").join("config.yaml"))
}

pub fn validate_context_name(name: &str) -> Result<()> {
    let re = regex::Regex::new("^[a-zA-Z0-9_-]+$")?;
    if !re.is_match(name) {
        bail!("invalid context name {name:?}: use letters, digits, '-' or '_'");
    }
    Ok(())
}

impl CliConfig {
    /// A missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("decoding config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading config {}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let text = serde_yaml::to_string(self).context("encoding config")?;
        std::fs::write(path, text).with_context(|| format!("writing config {}", path.display()))
    }

    /// Insert or replace by name. The first context added becomes current.
    pub fn add(&mut self, ctx: CliContext) {
        if self.current_context.is_empty() {
            self.current_context = ctx.name.clone();
        }
        match self.contexts.iter_mut().find(|c| c.name == ctx.name) {
            Some(existing) => *existing = ctx,
            None => self.contexts.push(ctx),
        }
    }

    pub fn set_current(&mut self, name: &str) -> Result<bool> {
        if !self.contexts.iter().any(|c| c.name == name) {
            bail!("context {name:?} not found");
        }
        let changed = self.current_context != name;
        self.current_context = name.to_string();
        Ok(changed)
    }

    pub fn current(&self) -> Result<&CliContext> {
        if self.current_context.is_empty() {
            bail!("no current context; run `stratactl context add`");
        }
        self.contexts
            .iter()
            .find(|c| c.name == self.current_context)
            .ok_or_else(|| anyhow!("current context {:?} not found", self.current_context))
    }

    pub fn context_mut(&mut self, name: &str) -> Result<&mut CliContext> {
        self.contexts.iter_mut().find(|c| c.name == name).ok_or_else(|| anyhow!("context {name:?} not found"))
    }
}
