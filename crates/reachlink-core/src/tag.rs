//! Correlation tags for tagged commands.

use uuid::Uuid;

/// A fresh, process-unique correlation tag.
pub fn generate_tag() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn tags_do_not_repeat() {
        let tags: HashSet<String> = (0..1000).map(|_| generate_tag()).collect();
        assert_eq!(tags.len(), 1000);
        assert!(tags.iter().all(|t| !t.is_empty()));
    }
}
