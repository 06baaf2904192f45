//! Machine-readable CLI output: exactly one JSON object per invocation on stdout.

use crate::{errors::ErrorReport, wallet::WalletEntry};
use serde_json::{json, Map, Value};
use std::io::Write as _;

fn stdout_writeln(s: &str) -> eyre::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{s}").map_err(|e| eyre::eyre!("write stdout: {e}"))?;
    stdout
        .flush()
        .map_err(|e| eyre::eyre!("flush stdout: {e}"))
}

/// Public view of a wallet row. The sealed credential never leaves the vault.
pub fn wallet_json(e: &WalletEntry) -> Value {
    json!({
        "id": e.id,
        "address": e.address,
        "key_type": e.key_type,
        "origin": e.origin,
        "derivation_index": e.derivation_index,
        "order_index": e.order_index,
        "selected": e.selected(),
        "deleted": e.deleted(),
        "can_sign": e.has_credential() && !e.deleted(),
        "created_at": e.created_at,
        "updated_at": e.updated_at,
    })
}

pub fn wallets_json(rows: &[WalletEntry]) -> Value {
    Value::Array(rows.iter().map(wallet_json).collect())
}

/// `{"ok": true, ...body}`. Non-object bodies are nested under `result`.
pub fn print_ok(body: Value) -> eyre::Result<()> {
    let mut out = Map::new();
    out.insert("ok".to_owned(), Value::Bool(true));
    match body {
        Value::Object(fields) => out.extend(fields),
        Value::Null => {}
        other => {
            out.insert("result".to_owned(), other);
        }
    }
    stdout_writeln(&Value::Object(out).to_string())
}

pub fn print_error(report: &ErrorReport) -> eyre::Result<()> {
    let body = json!({ "ok": false, "error": report });
    stdout_writeln(&body.to_string())
}
