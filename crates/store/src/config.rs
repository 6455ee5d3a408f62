use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use strata_apply::PayloadLimits;
use strata_core::StrataResult;
use strata_schema::SchemaRegistry;
use strata_watch::WatchConfig;

use crate::validate::{Validator, Validators};

/// Immutable store configuration, passed to the constructor.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub schemas: SchemaRegistry,
    /// When set, applies from any other manager are rejected.
    pub known_managers: Option<Arc<BTreeSet<String>>>,
    pub limits: PayloadLimits,
    pub watch: WatchConfig,
    /// Per-kind admission checks. Shared: registrations after construction are seen by the store.
    pub validators: Validators,
}

impl StoreConfig {
    /// Defaults overridden by `STRATA_*` variables:
    /// `STRATA_SCHEMA_DIR`, `STRATA_REQUIRE_SCHEMA`, `STRATA_KNOWN_MANAGERS`
    /// (comma separated), payload limits and watch retention.
    pub fn from_env() -> Result<Self> {
        let require = std::env::var("STRATA_REQUIRE_SCHEMA")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let mut schemas = SchemaRegistry::builder().require_known_kind(require);
        if let Some(dir) = std::env::var_os("STRATA_SCHEMA_DIR").map(PathBuf::from) {
            schemas = schemas.load_dir(&dir)?;
        }
        let known_managers = std::env::var("STRATA_KNOWN_MANAGERS")
            .ok()
            .map(|s| parse_managers(&s))
            .filter(|m| !m.is_empty())
            .map(Arc::new);
        Ok(Self {
            schemas: schemas.build(),
            known_managers,
            limits: PayloadLimits::from_env(),
            watch: WatchConfig::from_env(),
            validators: Validators::default(),
        })
    }

    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_known_managers<I, S>(mut self, managers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_managers = Some(Arc::new(managers.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_watch(mut self, watch: WatchConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_limits(mut self, limits: PayloadLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_validator(self, group: &str, kind: &str, validator: Arc<dyn Validator>) -> StrataResult<Self> {
        self.validators.register(group, kind, validator)?;
        Ok(self)
    }

    pub fn is_known_manager(&self, manager: &str) -> bool {
        self.known_managers.as_ref().map_or(true, |m| m.contains(manager))
    }
}

fn parse_managers(s: &str) -> BTreeSet<String> {
    s.split(',').map(str::trim).filter(|m| !m.is_empty()).map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manager_allow_list() {
        let open = StoreConfig::default();
        assert!(open.is_known_manager("anyone"));
        let closed = StoreConfig::default().with_known_managers(["hzctl", "ctlr-project"]);
        assert!(closed.is_known_manager("hzctl"));
        assert!(!closed.is_known_manager("intruder"));
    }

    #[test]
    fn manager_list_parsing() {
        let m = parse_managers(" a, b ,,c ");
        assert_eq!(m.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
