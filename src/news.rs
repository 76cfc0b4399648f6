//! RSS digest generation for the daily report job.
//!
//! Feeds are fetched concurrently, capped per source, filtered by include
//! keywords and a 24-hour window, deduplicated by link, capped in total,
//! and rendered by the configured renderer.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use regex_lite::Regex;

use crate::config::BotConfig;

const FEED_TIMEOUT_SECS: u64 = 10;
const SUMMARY_MAX_CHARS: usize = 64;

#[derive(Debug, Clone)]
pub struct NewsItem {
    pub source: String,
    pub title: String,
    pub link: String,
    pub published: DateTime<Utc>,
    pub summary: String,
}

pub trait ReportRenderer: Send + Sync {
    fn render(&self, title: &str, items: &[NewsItem]) -> String;
}

pub struct TextRenderer;

impl ReportRenderer for TextRenderer {
    fn render(&self, title: &str, items: &[NewsItem]) -> String {
        let mut lines = vec![format!("{} ({} items)\n", title, items.len())];
        for (i, item) in items.iter().enumerate() {
            lines.push(format!("{}. [{}] {}", i + 1, item.source, item.title));
            if !item.summary.is_empty() {
                lines.push(format!("   {}", item.summary));
            }
            lines.push(format!("   {}\n", item.link));
        }
        lines.join("\n")
    }
}

pub struct MarkdownRenderer;

impl ReportRenderer for MarkdownRenderer {
    fn render(&self, title: &str, items: &[NewsItem]) -> String {
        let mut lines = vec![format!("# {} ({})\n", title, items.len())];
        for (i, item) in items.iter().enumerate() {
            lines.push(format!("## {}. [{}] {}", i + 1, item.source, item.title));
            if !item.summary.is_empty() {
                lines.push(format!("> {}", item.summary));
            }
            lines.push(format!("[link]({})\n", item.link));
        }
        lines.join("\n")
    }
}

pub struct NewsService {
    client: reqwest::Client,
    config: BotConfig,
}

impl NewsService {
    pub fn new(config: BotConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch_feed(&self, name: &str, url: &str) -> Vec<NewsItem> {
        match self.try_fetch_feed(name, url).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("[{}] feed fetch failed: {:#}", name, e);
                Vec::new()
            }
        }
    }

    async fn try_fetch_feed(&self, name: &str, url: &str) -> Result<Vec<NewsItem>> {
        let response = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(FEED_TIMEOUT_SECS))
            .send()
            .await
            .context("Failed to fetch RSS feed")?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP error: {}", response.status());
        }

        let content = response.bytes().await.context("Failed to read RSS content")?;
        let channel = rss::Channel::read_from(&content[..]).context("Failed to parse RSS feed")?;

        let items = channel
            .items()
            .iter()
            .map(|item| {
                let summary = item
                    .description()
                    .map(|d| truncate_chars(&strip_html(d), SUMMARY_MAX_CHARS))
                    .unwrap_or_default();
                NewsItem {
                    source: name.to_string(),
                    title: item.title().unwrap_or("N/A").to_string(),
                    link: item.link().unwrap_or("#").to_string(),
                    published: parse_pub_date(item.pub_date()),
                    summary,
                }
            })
            .collect();
        Ok(items)
    }

    /// Fetch everything and assemble the report text.
    pub async fn build_report(&self) -> Result<String> {
        tracing::info!("Starting report generation");

        let fetches = self
            .config
            .rss_feeds
            .iter()
            .map(|(name, url)| self.fetch_feed(name, url));
        let per_feed = futures_util::future::join_all(fetches).await;

        let mut all_items = Vec::new();
        for mut items in per_feed {
            items.sort_by(|a, b| b.published.cmp(&a.published));
            items.truncate(self.config.max_items_per_feed);
            all_items.extend(items);
        }

        let selected = select_items(
            all_items,
            &self.config.include_keywords,
            &self.config.exclude_sources,
            self.config.max_total_items,
            Utc::now(),
        );

        let renderer = self.renderer();
        let report = renderer.render(&self.config.report_title, &selected);
        tracing::info!("Report generation finished ({} items)", selected.len());
        Ok(report)
    }

    fn renderer(&self) -> Box<dyn ReportRenderer> {
        match self.config.report_format.to_lowercase().as_str() {
            "markdown" | "md" => Box::new(MarkdownRenderer),
            _ => Box::new(TextRenderer),
        }
    }
}

/// Keyword/source filter, 24-hour window, link dedup and total cap, in
/// that order.
fn select_items(
    items: Vec<NewsItem>,
    include_keywords: &[String],
    exclude_sources: &[String],
    max_total: usize,
    now: DateTime<Utc>,
) -> Vec<NewsItem> {
    let cutoff = now - Duration::hours(24);
    let mut seen_links = std::collections::HashSet::new();
    let mut selected = Vec::new();

    for item in items {
        if !include_keywords.is_empty()
            && !include_keywords.iter().any(|kw| item.title.contains(kw))
        {
            continue;
        }
        if exclude_sources.contains(&item.source) {
            continue;
        }
        if item.published < cutoff {
            continue;
        }
        if !seen_links.insert(item.link.clone()) {
            continue;
        }
        selected.push(item);
        if selected.len() >= max_total {
            break;
        }
    }
    selected
}

fn strip_html(text: &str) -> String {
    // regex-lite has no lazy statics; the pattern is tiny and compiled per
    // call only on the report path.
    let tags = Regex::new(r"<[^>]+>").expect("static pattern");
    tags.replace_all(text, "").trim().to_string()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn parse_pub_date(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: &str, title: &str, link: &str, age_hours: i64) -> NewsItem {
        NewsItem {
            source: source.to_string(),
            title: title.to_string(),
            link: link.to_string(),
            published: Utc::now() - Duration::hours(age_hours),
            summary: String::new(),
        }
    }

    #[test]
    fn selection_filters_keywords_age_and_duplicates() {
        let items = vec![
            item("hn", "Rust 2.0 released", "a", 1),
            item("hn", "Gardening tips", "b", 1),
            item("hn", "Rust 2.0 released", "a", 2), // duplicate link
            item("blog", "Rust in production", "c", 30), // too old
            item("spam", "Rust spam", "d", 1),       // excluded source
        ];
        let selected = select_items(
            items,
            &["Rust".to_string()],
            &["spam".to_string()],
            10,
            Utc::now(),
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].link, "a");
    }

    #[test]
    fn total_cap_is_enforced() {
        let items = (0..20)
            .map(|i| item("hn", &format!("story {}", i), &format!("l{}", i), 1))
            .collect();
        let selected = select_items(items, &[], &[], 5, Utc::now());
        assert_eq!(selected.len(), 5);
    }

    #[test]
    fn html_is_stripped_and_summaries_truncated() {
        assert_eq!(
            strip_html("<p>Hello <b>world</b></p>"),
            "Hello world"
        );
        let long = "x".repeat(100);
        let short = truncate_chars(&long, 64);
        assert_eq!(short.chars().count(), 64);
        assert!(short.ends_with("..."));
    }

    #[test]
    fn pub_date_parsing_accepts_common_formats() {
        let rfc2822 = parse_pub_date(Some("Wed, 05 Aug 2026 10:00:00 GMT"));
        assert_eq!(rfc2822.format("%Y-%m-%d").to_string(), "2026-08-05");

        let rfc3339 = parse_pub_date(Some("2026-08-05T10:00:00Z"));
        assert_eq!(rfc3339, rfc2822);
    }

    #[test]
    fn renderers_include_every_item() {
        let items = vec![item("hn", "One", "l1", 1), item("hn", "Two", "l2", 1)];
        for renderer in [
            Box::new(TextRenderer) as Box<dyn ReportRenderer>,
            Box::new(MarkdownRenderer),
        ] {
            let report = renderer.render("Digest", &items);
            assert!(report.contains("One"));
            assert!(report.contains("Two"));
            assert!(report.contains("Digest"));
        }
    }
}
