use serde_json::Value as Json;
use strata_core::GenericObject;
use strata_schema::{project, PrinterColumn};

/// Left-aligned columns separated by three spaces.
pub fn render(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.len());
            }
        }
    }
    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}", w = *w))
            .collect();
        padded.join("   ").trim_end().to_string()
    };
    let mut out = line(headers);
    out.push('\n');
    for row in rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}

/// `ACCOUNT NAME <columns...> AGE` table for a list of objects of one kind.
pub fn objects(items: &[GenericObject], columns: &[PrinterColumn], now_secs: i64) -> String {
    let mut headers = vec!["ACCOUNT".to_string(), "NAME".to_string()];
    headers.extend(columns.iter().map(|c| c.name.to_uppercase()));
    headers.push("AGE".to_string());
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|obj| {
            let mut row = vec![obj.key.account.clone(), obj.key.name.clone()];
            row.extend(project(&obj.raw, columns));
            row.push(render_age(created_at(&obj.raw), now_secs));
            row
        })
        .collect();
    render(&headers, &rows)
}

fn created_at(raw: &Json) -> i64 {
    raw.pointer("/metadata/creationTimestamp")
        .and_then(|v| serde_json::from_value::<strata_core::Time>(v.clone()).ok())
        .map(|t| t.0.timestamp())
        .unwrap_or(0)
}

pub fn render_age(creation_ts: i64, now: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{secs}s")
    }
}
