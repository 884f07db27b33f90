use uuid::Uuid;

/// First eight hex chars of a uuid, used for sandbox directory and branch names.
pub fn short_uuid(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Trim a free-form string down to a log-friendly excerpt.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuid_is_eight_hex_chars() {
        let id = Uuid::new_v4();
        let short = short_uuid(&id);
        assert_eq!(short.len(), 8);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.simple().to_string().starts_with(&short));
    }

    #[test]
    fn excerpt_keeps_short_strings_and_cuts_long_ones() {
        assert_eq!(excerpt("  hello  ", 10), "hello");
        let long = "x".repeat(50);
        let cut = excerpt(&long, 10);
        assert_eq!(cut.chars().count(), 11);
        assert!(cut.ends_with('…'));
    }
}
