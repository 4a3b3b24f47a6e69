//! Names for sibling machine templates

/// Next name in a template's lineage
///
/// A trailing `-<n>` is incremented; anything else gets `-1` appended.
pub fn bump_name(name: &str) -> String {
    if let Some((stem, suffix)) = name.rsplit_once('-') {
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(n) = suffix.parse::<u64>() {
                return format!("{stem}-{}", n + 1);
            }
        }
    }
    format!("{name}-1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bumps_trailing_ordinal() {
        assert_eq!(bump_name("x-1"), "x-2");
        assert_eq!(bump_name("x"), "x-1");
        assert_eq!(bump_name("x-y"), "x-y-1");
    }

    #[test]
    fn story_template_names_after_stage() {
        let staged: Vec<_> = ["mt", "mt-3", "mt-3-5"].iter().map(|n| bump_name(n)).collect();
        assert_eq!(staged, vec!["mt-1", "mt-4", "mt-3-6"]);
    }

    #[test]
    fn only_the_last_segment_counts() {
        assert_eq!(bump_name("demo-control-plane-9"), "demo-control-plane-10");
        assert_eq!(bump_name("a-1b"), "a-1b-1");
    }
}
