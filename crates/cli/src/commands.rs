use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context as _, Result};
use serde_json::Value as Json;
use strata_api::StrataApi;
use strata_apply::{diff_summary, strip_noisy, PayloadLimits};
use strata_core::{key_from_payload, ApplyOutcome, ApplyRequest, Context, DeleteOutcome, ListFilter, ObjectKey};
use tracing::debug;

use crate::table;

/// Field manager name used for everything the CLI applies.
pub const MANAGER: &str = "stratactl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Output {
    Human,
    Json,
    Yaml,
}

/// Split a multi-document YAML stream on `---` separator lines, dropping empty documents.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut cur = String::new();
    for line in text.lines() {
        if line.trim_end() == "---" {
            docs.push(std::mem::take(&mut cur));
        } else {
            cur.push_str(line);
            cur.push('\n');
        }
    }
    docs.push(cur);
    docs.into_iter()
        .filter(|d| d.lines().any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#')))
        .collect()
}

/// Every object document in a YAML or JSON file.
pub fn read_documents(path: &Path) -> Result<Vec<Json>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let limits = PayloadLimits::from_env();
    let docs = split_documents(&text)
        .iter()
        .enumerate()
        .map(|(i, doc)| limits.parse_document(doc).with_context(|| format!("{}: document {}", path.display(), i + 1)))
        .collect::<Result<Vec<_>>>()?;
    if docs.is_empty() {
        bail!("{} contains no objects", path.display());
    }
    Ok(docs)
}

fn describe(key: &ObjectKey) -> String {
    format!("{}/{} {}/{}", key.group, key.kind, key.account, key.name)
}

pub async fn apply(api: &dyn StrataApi, ctx: &Context, path: &Path, force: bool, out: &mut dyn Write) -> Result<()> {
    for payload in read_documents(path)? {
        let key = key_from_payload(&payload)?;
        let before = match api.get(ctx, &key).await {
            Ok(obj) => Some(strip_noisy(obj.raw)),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e).with_context(|| format!("reading {}", describe(&key))),
        };
        let mut req = ApplyRequest::new(key.clone(), MANAGER, payload.clone());
        req.force = force;
        let outcome = api.apply(ctx, req).await.with_context(|| format!("applying {}", describe(&key)))?;
        match (outcome, before) {
            (ApplyOutcome::Updated, Some(before)) => {
                let sum = diff_summary(&payload, &before);
                writeln!(out, "{} updated (+{} ~{})", describe(&key), sum.adds, sum.updates)?;
            }
            (outcome, _) => writeln!(out, "{} {}", describe(&key), outcome.as_str())?,
        }
    }
    Ok(())
}

pub async fn delete(
    api: &dyn StrataApi,
    ctx: &Context,
    file: Option<&Path>,
    key: Option<&str>,
    out: &mut dyn Write,
) -> Result<()> {
    let mut keys = Vec::new();
    if let Some(path) = file {
        for doc in read_documents(path)? {
            keys.push(key_from_payload(&doc)?);
        }
    }
    if let Some(k) = key {
        keys.push(k.parse::<ObjectKey>().with_context(|| format!("parsing key {k:?}"))?);
    }
    if keys.is_empty() {
        bail!("nothing to delete: pass -f <file> or -k <group/version/kind/account/name>");
    }
    for key in keys {
        let outcome = api.delete(ctx, &key).await.with_context(|| format!("deleting {}", describe(&key)))?;
        let what = match outcome {
            DeleteOutcome::Purged => "deleted",
            DeleteOutcome::DeletionRequested => "deletion requested (waiting for finalizers)",
            DeleteOutcome::AlreadyDeleting => "already deleting",
        };
        writeln!(out, "{} {what}", describe(&key))?;
    }
    Ok(())
}

pub async fn get(
    api: &dyn StrataApi,
    ctx: &Context,
    target: &str,
    account: Option<&str>,
    output: Output,
    out: &mut dyn Write,
) -> Result<()> {
    let mut filter = ObjectKey::from_shorthand(target)?;
    if let Some(a) = account {
        filter.account = a.to_string();
    }
    let list = api.list(ctx, &ListFilter::new(filter.clone())).await.context("listing objects")?;
    debug!(filter = %filter, items = list.len(), "get: listed");
    if !filter.name.is_empty() && list.is_empty() {
        bail!("{} not found", filter.shorthand());
    }
    match output {
        Output::Json => writeln!(out, "{}", serde_json::to_string_pretty(&list.items)?)?,
        Output::Yaml => write!(out, "{}", serde_yaml::to_string(&list.items)?)?,
        Output::Human => {
            let kinds = api.kinds(ctx).await.context("fetching kinds")?;
            let columns = kinds
                .iter()
                .find(|k| k.kind == filter.kind && (filter.group.is_empty() || k.group == filter.group))
                .map(|k| k.columns())
                .unwrap_or_default();
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            write!(out, "{}", table::objects(&list.items, &columns, now))?;
        }
    }
    Ok(())
}
