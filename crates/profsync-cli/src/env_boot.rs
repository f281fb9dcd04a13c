use dotenv::dotenv;

/// Loads `.env` from the working directory, falling back to the crate root.
pub fn ensure_dotenv() {
    if dotenv().is_ok() {
        return;
    }
    let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
    let _ = dotenv::from_filename(candidate);
}
