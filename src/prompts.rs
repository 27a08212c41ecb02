use crate::models::{CandidateItem, TopicSignature};

/// Builds the bounded same-topic comparison prompt: the new item plus a
/// window of prior signature excerpts, each tagged with its signature id.
pub fn same_topic_prompt(candidate: &CandidateItem, window: &[TopicSignature]) -> String {
    let mut stories = String::new();
    for signature in window {
        stories.push_str(&format!(
            "Story {}: [{}] {}\n",
            signature.id, signature.theme, signature.excerpt
        ));
    }

    format!(
        "NEW ARTICLE:\nTitle: {}\n{}\n\nSTORIES ALREADY COVERED TODAY:\n{}\n\
Does the new article cover the same underlying story as one of the stories listed above? \
Coverage of the same event by a different outlet counts as the same story; a follow-up with \
genuinely new developments does not.\n\n\
Answer with a single JSON object and nothing else:\n\
{{\"matched_story\": <story number or null>, \"confidence\": <0.0 to 1.0>}}",
        candidate.title,
        truncate(&candidate.text, 2000),
        stories
    )
}

/// Builds a short theme label request for a freshly unique item.
pub fn theme_prompt(candidate: &CandidateItem) -> String {
    format!(
        "Title: {}\n{}\n\nName the story this article covers in at most eight words. \
Answer with the label only, no explanation.",
        candidate.title,
        truncate(&candidate.text, 1000)
    )
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn prompt_lists_every_window_signature() {
        let candidate = CandidateItem {
            id: "c1".to_string(),
            title: "Quake hits coast".to_string(),
            text: "A magnitude 6 earthquake struck early Friday.".to_string(),
            content_digest: "d".to_string(),
            source: "example.com".to_string(),
            authority_tier: 1,
            quality: 0.5,
            confidence: 0.9,
            discovered_at: Utc::now(),
        };
        let window: Vec<TopicSignature> = (1..=3)
            .map(|i| TopicSignature {
                id: i,
                day: Utc::now().date_naive(),
                run_sequence: 1,
                theme: format!("theme-{}", i),
                excerpt: format!("excerpt-{}", i),
                source_item_id: format!("s{}", i),
                created_at: Utc::now(),
            })
            .collect();

        let prompt = same_topic_prompt(&candidate, &window);
        for signature in &window {
            assert!(prompt.contains(&format!("Story {}:", signature.id)));
            assert!(prompt.contains(&signature.theme));
        }
        assert!(prompt.contains("matched_story"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 100), "short");
    }
}
