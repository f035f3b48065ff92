use std::process::ExitCode;

use utoipa::OpenApi;

fn main() -> ExitCode {
    let doc = match session_api::routes::ApiDoc::openapi().to_pretty_json() {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("failed to render OpenAPI document: {e}");
            return ExitCode::FAILURE;
        }
    };
    let out = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../specs/session-api.json");
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("failed to create {}: {e}", parent.display());
            return ExitCode::FAILURE;
        }
    }
    if let Err(e) = std::fs::write(&out, doc) {
        eprintln!("failed to write {}: {e}", out.display());
        return ExitCode::FAILURE;
    }
    println!("Wrote {}", out.display());
    ExitCode::SUCCESS
}
