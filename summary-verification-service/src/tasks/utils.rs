use anyhow::anyhow;

use crate::models::Document;

/// The parts of a document that generation and verification prompts see
#[derive(Debug, Clone, Copy)]
pub struct SourceText<'a> {
    pub title: &'a str,
    pub content: &'a str,
    pub category: Option<&'a str>,
}

impl<'a> From<&'a Document> for SourceText<'a> {
    fn from(document: &'a Document) -> Self {
        Self {
            title: &document.title,
            content: &document.source_content,
            category: document.category.as_deref(),
        }
    }
}

impl SourceText<'_> {
    pub fn header(&self) -> String {
        match self.category {
            Some(category) if !category.trim().is_empty() => {
                format!("Title: {}\nCategory: {}", self.title, category.trim())
            }
            _ => format!("Title: {}", self.title),
        }
    }
}

/// Strip wrapping the model sometimes adds around a plain-text summary
pub fn clean_generated_summary(raw: &str) -> anyhow::Result<String> {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        // drop an optional language tag on the fence line
        text = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
        text = text.trim_end().strip_suffix("```").unwrap_or(text).trim();
    }

    for label in ["Summary:", "SUMMARY:"] {
        if let Some(rest) = text.strip_prefix(label) {
            text = rest.trim_start();
        }
    }

    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        text = text[1..text.len() - 1].trim();
    }

    if text.is_empty() {
        return Err(anyhow!("text generation returned an empty summary"));
    }
    Ok(text.to_string())
}

pub fn numbered_list(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item))
        .collect::<Vec<_>>()
        .join("\n")
}
