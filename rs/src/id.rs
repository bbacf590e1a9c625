//! Record identity generation and validation

use std::sync::LazyLock;

use regex::Regex;

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-8][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("UUID pattern is a valid regex")
});

/// Generate a new record id (UUID v4, lowercase hyphenated)
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Whether `id` is a canonical 8-4-4-4-12 UUID with valid version and variant nibbles
pub fn is_valid_uuid(id: &str) -> bool {
    UUID_PATTERN.is_match(id)
}
