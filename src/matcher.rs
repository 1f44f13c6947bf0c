use regex::Regex;
use std::sync::OnceLock;

use crate::models::{Posting, Profile, ScoredPosting};

const SKILL_POINTS: u32 = 10;
const KEYWORD_POINTS: u32 = 5;
const LOCATION_POINTS: u32 = 15;
const MAX_SCORE: u32 = 100;

/// Word characters for matching. `+` and `#` are kept so `C++` and `C#`
/// survive; everything else separates words, so `Node.js` is `node js`.
fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9+#]+").expect("static regex"))
}

fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    token_re()
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Whole-word match: the term's tokens must appear contiguously in `haystack`.
/// "Java" does not match "JavaScript".
fn contains_term(haystack: &[String], term: &str) -> bool {
    let needle = tokenize(term);
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle.as_slice())
}

pub fn location_matches(posting_location: &str, locations: &[String]) -> bool {
    let posting_location = posting_location.trim().to_lowercase();
    if posting_location.is_empty() {
        return false;
    }
    locations.iter().any(|loc| {
        let loc = loc.trim().to_lowercase();
        !loc.is_empty() && posting_location.contains(&loc)
    })
}

pub fn score_posting(posting: &Posting, profile: &Profile) -> ScoredPosting {
    let tokens = tokenize(&format!(
        "{} {} {}",
        posting.title,
        posting.description,
        posting.skills.join(" ")
    ));

    let matched_skills: Vec<String> = profile
        .skills
        .iter()
        .filter(|skill| contains_term(&tokens, skill))
        .cloned()
        .collect();

    let matched_keywords: Vec<String> = profile
        .keywords
        .iter()
        .filter(|keyword| contains_term(&tokens, keyword))
        .cloned()
        .collect();

    let matched_location = location_matches(&posting.location, &profile.locations);

    let raw = SKILL_POINTS * matched_skills.len() as u32
        + KEYWORD_POINTS * matched_keywords.len() as u32
        + if matched_location { LOCATION_POINTS } else { 0 };

    ScoredPosting {
        posting: posting.clone(),
        score: raw.min(MAX_SCORE) as u8,
        matched_skills,
        matched_keywords,
        matched_location,
    }
}

pub fn match_summary(scored: &ScoredPosting) -> String {
    let mut parts = Vec::new();

    if !scored.matched_skills.is_empty() {
        let skills: Vec<&str> = scored.matched_skills.iter().take(5).map(String::as_str).collect();
        parts.push(format!("Skills: {}", skills.join(", ")));
    }
    if !scored.matched_keywords.is_empty() {
        let keywords: Vec<&str> = scored.matched_keywords.iter().take(3).map(String::as_str).collect();
        parts.push(format!("Keywords: {}", keywords.join(", ")));
    }
    if scored.matched_location {
        parts.push(format!("Location: {}", scored.posting.location));
    }

    if parts.is_empty() {
        "General match".to_string()
    } else {
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::raw;
    use chrono::Utc;

    fn profile(skills: &[&str], keywords: &[&str], locations: &[&str]) -> Profile {
        Profile {
            skills: skills.iter().map(|s| s.to_string()).collect(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            locations: locations.iter().map(|s| s.to_string()).collect(),
            min_match_score: 0,
        }
    }

    fn posting(title: &str, location: &str, description: &str) -> Posting {
        Posting::from_raw(raw(title, "Acme", location, description, ""), Utc::now())
    }

    #[test]
    fn test_skill_tags_count_toward_score() {
        let p = profile(&["Python", "Docker"], &[], &[]);
        let mut job = posting("Engineer", "Berlin", "Build our platform.");
        assert_eq!(score_posting(&job, &p).score, 0);

        job.skills = vec!["Python".into(), "Docker".into()];
        let scored = score_posting(&job, &p);
        assert_eq!(scored.score, 20);
        assert_eq!(scored.matched_skills, vec!["Python", "Docker"]);
    }

    #[test]
    fn test_partial_multi_word_tag_does_not_match() {
        let p = profile(&["Machine Learning"], &[], &[]);
        let mut job = posting("Engineer", "Berlin", "");
        job.skills = vec!["Machine".into(), "Vision".into()];
        assert!(score_posting(&job, &p).matched_skills.is_empty());
    }

    #[test]
    fn test_worked_example() {
        let p = profile(&["Python", "FastAPI"], &["backend"], &["Remote"]);

        let job = posting("Engineer", "Remote", "Python backend role, fully Remote");
        let scored = score_posting(&job, &p);
        assert_eq!(scored.score, 30);
        assert_eq!(scored.matched_skills, vec!["Python"]);
        assert_eq!(scored.matched_keywords, vec!["backend"]);
        assert!(scored.matched_location);

        let job = posting("FastAPI Engineer", "Remote", "Python backend role, fully Remote");
        let scored = score_posting(&job, &p);
        assert_eq!(scored.score, 40);
        assert_eq!(scored.matched_skills, vec!["Python", "FastAPI"]);
    }

    #[test]
    fn test_whole_word_matching() {
        let p = profile(&["Java", "Go"], &[], &[]);
        let job = posting("Frontend Dev", "NYC", "JavaScript at Google");
        assert_eq!(score_posting(&job, &p).score, 0);

        let job = posting("Java Dev", "NYC", "We use Go.");
        assert_eq!(score_posting(&job, &p).matched_skills, vec!["Java", "Go"]);
    }

    #[test]
    fn test_symbols_and_multi_word_terms() {
        let p = profile(&["C++", "Node.js", "Machine Learning"], &["CI/CD"], &[]);
        let job = posting(
            "ML Engineer",
            "Berlin",
            "Modern C++, node.js services, machine   learning pipelines and CI/CD.",
        );
        let scored = score_posting(&job, &p);
        assert_eq!(scored.matched_skills, vec!["C++", "Node.js", "Machine Learning"]);
        assert_eq!(scored.matched_keywords, vec!["CI/CD"]);
        assert_eq!(scored.score, 35);

        let job = posting("Dev", "Berlin", "C and C# only");
        assert!(score_posting(&job, &p).matched_skills.is_empty());
    }

    #[test]
    fn test_matched_skills_follow_profile_order() {
        let p = profile(&["Rust", "Python", "Docker"], &[], &[]);
        let job = posting("Docker Python Rust", "", "");
        assert_eq!(score_posting(&job, &p).matched_skills, vec!["Rust", "Python", "Docker"]);
    }

    #[test]
    fn test_score_is_clamped() {
        let skills: Vec<String> = (0..15).map(|i| format!("skill{}", i)).collect();
        let description = skills.join(" ");
        let p = Profile {
            skills,
            keywords: vec![],
            locations: vec!["Remote".into()],
            min_match_score: 0,
        };
        let job = posting("Engineer", "Remote", &description);
        assert_eq!(score_posting(&job, &p).score, 100);
    }

    #[test]
    fn test_adding_matching_skill_never_decreases_score() {
        let job = posting("Rust Engineer", "Remote (US)", "Rust, Tokio, Postgres, backend");
        let mut p = profile(&["Rust"], &["backend"], &["remote"]);
        let mut previous = score_posting(&job, &p).score;
        for skill in ["Tokio", "Postgres", "Kafka"] {
            p.skills.push(skill.to_string());
            let next = score_posting(&job, &p).score;
            assert!(next >= previous);
            previous = next;
        }
        assert_eq!(previous, 10 * 3 + 5 + 15);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let p = profile(&["Python"], &["api"], &["Remote"]);
        let job = posting("Python API", "Remote", "api");
        assert_eq!(score_posting(&job, &p), score_posting(&job, &p));
    }

    #[test]
    fn test_location_matches() {
        let locations = vec!["Remote".to_string(), "San Francisco".to_string()];
        assert!(location_matches("United States (Remote)", &locations));
        assert!(location_matches("san francisco, ca", &locations));
        assert!(!location_matches("New York", &locations));
        assert!(!location_matches("", &locations));
        assert!(!location_matches("Remote", &[String::new()]));
    }

    #[test]
    fn test_location_is_not_matched_from_description() {
        let p = profile(&[], &[], &["Remote"]);
        let job = posting("Engineer", "Berlin", "remote friendly");
        assert!(!score_posting(&job, &p).matched_location);
    }

    #[test]
    fn test_match_summary() {
        let p = profile(&["Python"], &["backend"], &["Remote"]);
        let job = posting("Python backend", "Remote", "");
        assert_eq!(
            match_summary(&score_posting(&job, &p)),
            "Skills: Python | Keywords: backend | Location: Remote"
        );

        let job = posting("Chef", "Paris", "");
        assert_eq!(match_summary(&score_posting(&job, &p)), "General match");
    }
}
