// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

/// Render a `{{name}}` placeholder template against a JSON argument map.
///
/// Deterministic: the same `(template, args)` pair always produces the same
/// text, which is what lets the rendered system prompt be cached on the
/// session row.  Unknown placeholders are left verbatim so a typo is visible
/// instead of silently vanishing.
pub fn render_template(template: &str, args: &Value) -> String {
    let Some(map) = args.as_object() else {
        return template.to_string();
    };
    let mut out = template.to_string();
    for (key, value) in map {
        let needle = format!("{{{{{key}}}}}");
        let replacement = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
