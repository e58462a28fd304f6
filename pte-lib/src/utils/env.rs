pub const fn pte_identifier() -> &'static str {
    concat!("pte/", env!("CARGO_PKG_VERSION"))
}

/// Process id used in transaction keys, overridable for reproducible key sets.
pub fn process_tag() -> u32 {
    std::env::var("PTE_PROCESS_TAG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(std::process::id)
}
