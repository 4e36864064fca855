use ulid::Ulid;

/// Per-run identifier, lowercased so it is valid in Docker resource names.
pub fn new_run_id() -> String {
    Ulid::new().to_string().to_lowercase()
}
