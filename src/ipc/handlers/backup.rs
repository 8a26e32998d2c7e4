use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn workspace_param(state: &AppState, req: &Request) -> Option<PathBuf> {
    req.params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone())
}

fn handle_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let Some(workspace_path) = workspace_param(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    match backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path)) {
        Ok(export) => {
            tracing::info!(path = %out_path, sha256 = %export.db_sha256, "workspace exported");
            ok(
                &req.id,
                json!({
                    "path": out_path,
                    "bundleFormat": export.bundle_format,
                    "dbSha256": export.db_sha256,
                    "dbBytes": export.db_bytes
                }),
            )
        }
        Err(e) => err(
            &req.id,
            "backup_export_failed",
            format!("{e:#}"),
            Some(json!({ "path": out_path })),
        ),
    }
}

fn handle_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let Some(workspace_path) = workspace_param(state, req) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }

    // Release the current handle before the db file is replaced.
    let replacing_open = state.workspace.as_deref() == Some(workspace_path.as_path());
    if replacing_open {
        state.db = None;
    }

    let import = match backup::import_workspace_bundle(&in_path, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            if replacing_open {
                state.db = db::open_db(&workspace_path).ok();
            }
            return err(
                &req.id,
                "backup_import_failed",
                format!("{e:#}"),
                Some(json!({ "path": in_path.to_string_lossy() })),
            );
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            tracing::info!(workspace = %workspace_path.display(), "workspace restored from bundle");
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormat": import.bundle_format,
                    "dbSha256": import.db_sha256
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import_workspace_bundle(state, req)),
        _ => None,
    }
}
