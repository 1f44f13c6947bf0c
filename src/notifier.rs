use reqwest::blocking::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::TelegramCredentials;
use crate::models::ScoredPosting;
use crate::pipeline::RunSummary;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Where a batch sits within the run, for headers and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchContext {
    pub index: usize,
    pub total_batches: usize,
    pub total_postings: usize,
}

pub trait NotificationSink {
    fn send(&self, batch: &[ScoredPosting], ctx: BatchContext) -> Result<(), NotifyError>;

    fn send_summary(&self, _summary: &RunSummary) -> Result<(), NotifyError> {
        Ok(())
    }
}

const TELEGRAM_API_URL: &str = "https://api.telegram.org";
const MARKDOWN_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inside a MarkdownV2 link target only `)` and `\` need escaping.
fn escape_link(url: &str) -> String {
    url.replace('\\', "\\\\").replace(')', "\\)")
}

pub fn render_job(job: &ScoredPosting) -> String {
    let p = &job.posting;
    let skills = if job.matched_skills.is_empty() {
        "See description".to_string()
    } else {
        escape_markdown(&job.matched_skills.iter().take(5).cloned().collect::<Vec<_>>().join(", "))
    };
    let location = if p.location.trim().is_empty() { "Not specified" } else { p.location.as_str() };
    let pay = match (&p.salary, &p.equity) {
        (Some(salary), Some(equity)) => Some(format!("{} • {}", salary, equity)),
        (Some(salary), None) => Some(salary.clone()),
        (None, Some(equity)) => Some(format!("Equity {}", equity)),
        (None, None) => None,
    };
    let pay = pay
        .map(|text| format!("💰 *Compensation:* {}\n", escape_markdown(&text)))
        .unwrap_or_default();

    format!(
        "🚀 *New Job Match\\!* \\(Score: {}/100\\)\n\n\
         📋 *Title:* {}\n\
         🏢 *Company:* {}\n\
         📍 *Location:* {}\n\
         {}\n\
         💡 *Matched Skills:* {}\n\n\
         🔗 [Apply Now]({})\n\n\
         ───────────────────\n",
        job.score,
        escape_markdown(&p.title),
        escape_markdown(&p.company),
        escape_markdown(location),
        pay,
        skills,
        escape_link(&p.url),
    )
}

pub fn render_batch(batch: &[ScoredPosting], ctx: BatchContext) -> String {
    let mut message = String::new();
    if ctx.index == 0 {
        message.push_str(&format!(
            "📬 *Daily Job Alert* \\- {} new matches\\!\n\n",
            ctx.total_postings
        ));
    }
    for job in batch {
        message.push_str(&render_job(job));
    }
    message
}

pub fn render_summary(summary: &RunSummary) -> String {
    format!(
        "📊 *Automation Summary*\n\n\
         🔍 Total jobs scraped: {}\n\
         🆕 New jobs: {}\n\
         ✅ Jobs matched: {}\n\
         📨 Alerts sent: {}\n\
         ⚠️ Alerts failed: {}\n\n\
         _Next run scheduled for tomorrow\\._\n",
        summary.fetched, summary.new, summary.matched, summary.notified, summary.failed,
    )
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(credentials: TelegramCredentials) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            api_url: format!("{}/bot{}", TELEGRAM_API_URL, credentials.bot_token),
            chat_id: credentials.chat_id,
        })
    }

    pub fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "MarkdownV2",
            disable_web_page_preview: false,
        };

        let response = self
            .client
            .post(format!("{}/sendMessage", self.api_url))
            .json(&request)
            .send()
            .map_err(|e| NotifyError(format!("Telegram request failed: {}", e.without_url())))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(NotifyError(format!(
                "Telegram API error {}: {}",
                status, error_text
            )));
        }
        Ok(())
    }
}

impl NotificationSink for TelegramNotifier {
    fn send(&self, batch: &[ScoredPosting], ctx: BatchContext) -> Result<(), NotifyError> {
        tracing::debug!(batch = ctx.index + 1, of = ctx.total_batches, jobs = batch.len(), "sending telegram message");
        self.send_message(&render_batch(batch, ctx))
    }

    fn send_summary(&self, summary: &RunSummary) -> Result<(), NotifyError> {
        self.send_message(&render_summary(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{raw, Posting};
    use chrono::Utc;

    fn job(title: &str, skills: &[&str], score: u8) -> ScoredPosting {
        ScoredPosting {
            posting: Posting::from_raw(
                raw(title, "Tech.Corp", "Remote", "", "https://wellfound.com/jobs/1-a_b"),
                Utc::now(),
            ),
            score,
            matched_skills: skills.iter().map(|s| s.to_string()).collect(),
            matched_keywords: vec![],
            matched_location: true,
        }
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("C++ (senior)"), "C\\+\\+ \\(senior\\)");
        assert_eq!(escape_markdown("plain text"), "plain text");
        assert_eq!(escape_markdown("a_b.c!"), "a\\_b\\.c\\!");
    }

    #[test]
    fn test_render_job_has_required_fields() {
        let message = render_job(&job("Senior Python Developer", &["Python", "FastAPI"], 85));
        assert!(message.contains("Score: 85/100"));
        assert!(message.contains("*Title:* Senior Python Developer"));
        assert!(message.contains("*Company:* Tech\\.Corp"));
        assert!(message.contains("*Location:* Remote"));
        assert!(message.contains("*Matched Skills:* Python, FastAPI"));
        assert!(message.contains("[Apply Now](https://wellfound.com/jobs/1-a_b)"));
    }

    #[test]
    fn test_render_job_compensation() {
        let mut j = job("Engineer", &["Rust"], 60);
        assert!(!render_job(&j).contains("Compensation"));

        j.posting.salary = Some("$90k – $115k".into());
        j.posting.equity = Some("0.1%".into());
        let message = render_job(&j);
        assert!(message.contains("💰 *Compensation:* $90k – $115k • 0\\.1%\n"));
        assert!(message.contains("📍 *Location:* Remote\n💰"));
    }

    #[test]
    fn test_render_job_without_skills() {
        let message = render_job(&job("Engineer", &[], 20));
        assert!(message.contains("See description"));
    }

    #[test]
    fn test_render_job_caps_skills_at_five() {
        let message = render_job(&job("Engineer", &["a", "b", "c", "d", "e", "f"], 60));
        assert!(message.contains("a, b, c, d, e\n"));
    }

    #[test]
    fn test_header_only_on_first_batch() {
        let batch = vec![job("Engineer", &["Rust"], 50)];
        let first = render_batch(&batch, BatchContext { index: 0, total_batches: 2, total_postings: 3 });
        let second = render_batch(&batch, BatchContext { index: 1, total_batches: 2, total_postings: 3 });
        assert!(first.starts_with("📬 *Daily Job Alert* \\- 3 new matches"));
        assert!(!second.contains("Daily Job Alert"));
    }
}
