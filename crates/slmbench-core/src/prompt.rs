use serde::{Deserialize, Serialize};

/// Task family a benchmark prompt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Summarization,
    Extraction,
    Reasoning,
    Classification,
    QuestionAnswering,
    Creative,
    Coding,
    Translation,
    #[serde(other)]
    Other,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Summarization => "Summarization",
            Category::Extraction => "Extraction",
            Category::Reasoning => "Reasoning",
            Category::Classification => "Classification",
            Category::QuestionAnswering => "QuestionAnswering",
            Category::Creative => "Creative",
            Category::Coding => "Coding",
            Category::Translation => "Translation",
            Category::Other => "Other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One benchmark case from the dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptItem {
    pub id: String,
    pub category: Category,
    pub prompt: String,
    #[serde(default)]
    pub reference: Option<String>,
    pub max_tokens: u32,
}

impl PromptItem {
    /// First `max_chars` characters of the prompt, for progress lines.
    pub fn preview(&self, max_chars: usize) -> String {
        let mut chars = self.prompt.chars();
        let head: String = chars.by_ref().take(max_chars).collect();
        match chars.next() {
            Some(_) => format!("{}...", head),
            None => head,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// `None` leaves the generation length to the runtime.
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

impl GenerationOptions {
    /// A run-wide override wins over the item's own budget.
    pub fn for_item(item: &PromptItem, max_tokens_override: Option<u32>, temperature: f32) -> Self {
        Self {
            max_tokens: Some(max_tokens_override.unwrap_or(item.max_tokens)),
            temperature,
        }
    }
}
