// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Result processing: field selection, preview, externalization.
//!
//! Only the lightweight view ever reaches the event log: small payloads
//! inline, anything above the threshold as a [`ResultRef`] with extracted
//! scalars and a truncated preview.

use noetl_core::{get_path, ResultScope, StepResult, StoreTier};
use noetl_playbook::OutputDef;
use noetl_storage::{StoreError, TieredStore};
use serde_json::Value;
use std::collections::BTreeMap;

/// Turn a raw tool result into the event-safe [`StepResult`].
///
/// Selection (`output.select`) runs first, against the raw payload; the
/// extracted fields ride along whether or not the payload externalizes.
#[allow(clippy::too_many_arguments)]
pub async fn process_result(
    store: &TieredStore,
    key: &str,
    raw: &Value,
    output: Option<&OutputDef>,
    inline_max_bytes: usize,
    preview_max_chars: usize,
    now_ms: u64,
) -> Result<StepResult, StoreError> {
    let extracted = select_fields(raw, output);
    let scope = output.map(|o| o.scope).unwrap_or_default();
    let inline_max = output
        .and_then(|o| o.inline_max_bytes)
        .unwrap_or(inline_max_bytes);

    let size = serde_json::to_vec(raw)?.len();
    let forced_tier = output.and_then(|o| explicit_tier(&o.store.kind));

    // Durable scopes externalize regardless of size; otherwise small
    // payloads stay inline.
    let durable = matches!(scope, ResultScope::Workflow | ResultScope::Permanent);
    if size <= inline_max && forced_tier.is_none() && !durable {
        return Ok(StepResult::inline(raw.clone()));
    }

    let ttl_ms = output.and_then(|o| o.ttl_ms);
    let mut reference = store.put_payload(key, raw, scope, ttl_ms, now_ms).await?;
    if let Some(tier) = forced_tier {
        // Explicit store kind overrides the auto rule's tag only when the
        // payload actually landed there; re-route if needed.
        if reference.store != tier {
            store.delete(&reference).await?;
            reference = store.put_payload_in(key, raw, tier, scope, ttl_ms, now_ms).await?;
        }
    }
    reference.extracted = extracted;
    reference.preview = Some(preview(raw, preview_max_chars));
    Ok(StepResult::external(reference))
}

fn explicit_tier(kind: &str) -> Option<StoreTier> {
    match kind {
        "memory" => Some(StoreTier::Memory),
        "kv" => Some(StoreTier::Kv),
        "object" => Some(StoreTier::Object),
        "s3" | "gcs" | "cloud" => Some(StoreTier::Cloud),
        _ => None,
    }
}

/// Evaluate `output.select` dotted paths against the raw payload.
fn select_fields(raw: &Value, output: Option<&OutputDef>) -> BTreeMap<String, Value> {
    let mut extracted = BTreeMap::new();
    if let Some(output) = output {
        for (name, path) in &output.select {
            match get_path(raw, path) {
                Some(value) => {
                    extracted.insert(name.clone(), value.clone());
                }
                None => {
                    tracing::debug!(field = %name, path = %path, "output.select path missing");
                }
            }
        }
    }
    extracted
}

/// Truncated sample of the payload for display.
fn preview(raw: &Value, max_chars: usize) -> String {
    let rendered = raw.to_string();
    if rendered.chars().count() <= max_chars {
        return rendered;
    }
    let truncated: String = rendered.chars().take(max_chars).collect();
    format!("{truncated}…")
}

/// The view that flows into loop results and render contexts: extracted
/// fields when selection was declared, the full inline value otherwise.
pub fn lightweight_view(result: &StepResult, output: Option<&OutputDef>) -> Value {
    match (output, &result.inline) {
        (Some(o), Some(inline)) if !o.select.is_empty() => {
            let mut map = serde_json::Map::new();
            for (name, path) in &o.select {
                if let Some(value) = get_path(inline, path) {
                    map.insert(name.clone(), value.clone());
                }
            }
            Value::Object(map)
        }
        _ => result.render_view(),
    }
}

#[cfg(test)]
#[path = "externalize_tests.rs"]
mod tests;
