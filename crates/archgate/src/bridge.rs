//! Line-delimited JSON request/response loop over stdin/stdout.
//!
//! Request: `{"id": .., "method": "..", "params": {..}}`.
//! Response: `{"id": .., "ok": true, "result": ..}` or
//! `{"id": .., "ok": false, "error": ".."}`. A bad request yields an error
//! response; the loop only ends at EOF.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use archgate_contracts::ARCHGATE_BRIDGE_SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::{self, Workspace};

pub const METHODS: [&str; 3] = ["report.get", "fix.apply", "scan.path"];

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    #[serde(rename = "schemaVersion")]
    pub schema_version: &'static str,
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            schema_version: ARCHGATE_BRIDGE_SCHEMA_VERSION,
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, error: String) -> Self {
        Self {
            schema_version: ARCHGATE_BRIDGE_SCHEMA_VERSION,
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

fn dispatch(root: &Path, method: &str, params: &Value) -> Result<Value> {
    // Config is re-read per request so edits between calls take effect.
    let ws = Workspace::open(root);
    match method {
        "report.get" => Ok(serde_json::to_value(pipeline::current_report(&ws))?),
        "fix.apply" => {
            let dry_run = params.get("dryRun").and_then(Value::as_bool).unwrap_or(false);
            Ok(serde_json::to_value(pipeline::fix(&ws, dry_run)?)?)
        }
        "scan.path" => {
            let path = params
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("scan.path requires params.path"))?;
            let (summary, _) = pipeline::scan(&ws, Some(path))?;
            Ok(serde_json::to_value(summary)?)
        }
        other => Err(anyhow!(
            "unknown method {other:?} (expected one of: {})",
            METHODS.join(", ")
        )),
    }
}

pub fn handle_line(root: &Path, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(err) => return Response::err(Value::Null, format!("parse request: {err}")),
    };
    tracing::debug!(method = %req.method, "bridge request");
    match dispatch(root, &req.method, &req.params) {
        Ok(result) => Response::ok(req.id, result),
        Err(err) => Response::err(req.id, format!("{err:#}")),
    }
}

/// Serves requests until EOF and returns how many were answered.
pub fn serve(root: PathBuf, input: impl BufRead, mut output: impl Write) -> Result<u64> {
    let mut answered = 0u64;
    for line in input.lines() {
        let line = line.context("read bridge input")?;
        if line.trim().is_empty() {
            continue;
        }
        let resp = handle_line(&root, &line);
        let mut bytes = serde_json::to_vec(&resp)?;
        bytes.push(b'\n');
        output.write_all(&bytes).context("write bridge output")?;
        output.flush().context("flush bridge output")?;
        answered += 1;
    }
    Ok(answered)
}
