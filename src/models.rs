use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A posting as yielded by a source, before identity is assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosting {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub url: String,
    /// Skill tags shown next to the posting, scored along with the text.
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub salary: Option<String>,
    #[serde(default)]
    pub equity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub url: String,
    pub skills: Vec<String>,
    pub salary: Option<String>,
    pub equity: Option<String>,
    pub first_seen_at: DateTime<Utc>,
}

impl Posting {
    pub fn from_raw(raw: RawPosting, seen_at: DateTime<Utc>) -> Self {
        let id = posting_id(&raw.url, &raw.title, &raw.company, &raw.location);
        Self {
            id,
            title: raw.title,
            company: raw.company,
            location: raw.location,
            description: raw.description,
            url: raw.url,
            skills: raw.skills,
            salary: raw.salary,
            equity: raw.equity,
            first_seen_at: seen_at,
        }
    }
}

/// Stable identity: hash of the url, or of title/company/location when the
/// source gave no link.
pub fn posting_id(url: &str, title: &str, company: &str, location: &str) -> String {
    let url = url.trim();
    if !url.is_empty() {
        return stable_hash(url);
    }
    let key = [title, company, location]
        .iter()
        .map(|s| s.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join("\u{1f}");
    stable_hash(&key)
}

fn stable_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default = "Profile::default_min_match_score")]
    pub min_match_score: u8,
}

impl Profile {
    pub fn default_min_match_score() -> u8 {
        50
    }

    /// Trims entries, drops blanks and case-insensitive repeats (first wins).
    pub fn normalized(mut self) -> Self {
        self.skills = dedup_terms(self.skills);
        self.keywords = dedup_terms(self.keywords);
        self.locations = dedup_terms(self.locations);
        self
    }
}

fn dedup_terms(terms: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    terms
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredPosting {
    pub posting: Posting,
    pub score: u8,
    pub matched_skills: Vec<String>,
    pub matched_keywords: Vec<String>,
    pub matched_location: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub id: String,
    pub first_seen_at: DateTime<Utc>,
}

/// Delivery bookkeeping kept next to each seen record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Pending,
    Notified,
    Failed,
    Skipped,
}

impl NotifyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyStatus::Pending => "pending",
            NotifyStatus::Notified => "notified",
            NotifyStatus::Failed => "failed",
            NotifyStatus::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
pub fn raw(title: &str, company: &str, location: &str, description: &str, url: &str) -> RawPosting {
    RawPosting {
        title: title.to_string(),
        company: company.to_string(),
        location: location.to_string(),
        description: description.to_string(),
        url: url.to_string(),
        ..Default::default()
    }
}
