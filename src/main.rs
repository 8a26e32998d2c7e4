mod backup;
mod calc;
mod db;
mod ipc;
mod logging;
mod models;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

const WORKSPACE_ENV: &str = "RESULTSD_WORKSPACE";

fn main() {
    logging::init();

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    if let Some(path) = std::env::var_os(WORKSPACE_ENV).map(PathBuf::from) {
        match db::open_db(&path) {
            Ok(conn) => {
                tracing::info!(workspace = %path.display(), "opened workspace from environment");
                state.workspace = Some(path);
                state.db = Some(conn);
            }
            Err(e) => {
                tracing::warn!(workspace = %path.display(), error = %e, "failed to open workspace from environment");
            }
        }
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resultsd ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                tracing::warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    tracing::info!("resultsd shutting down");
}
