//! Session models
//!
//! Notes, tasks and participants are owned by the moderator's session
//! state. Contributors only build transient drafts and a local mirror of
//! the category labels and language.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{NoteId, ParticipantId, RetroError, TaskId, Timestamp};

/// Submission category, including the task column
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Good,
    Neutral,
    Bad,
    #[serde(alias = "tasks")]
    Task,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Good,
        Category::Neutral,
        Category::Bad,
        Category::Task,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Good => "good",
            Category::Neutral => "neutral",
            Category::Bad => "bad",
            Category::Task => "task",
        }
    }

    /// The note column for this category, `None` for tasks
    pub fn note_category(self) -> Option<NoteCategory> {
        match self {
            Category::Good => Some(NoteCategory::Good),
            Category::Neutral => Some(NoteCategory::Neutral),
            Category::Bad => Some(NoteCategory::Bad),
            Category::Task => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = RetroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(Category::Good),
            "neutral" => Ok(Category::Neutral),
            "bad" => Ok(Category::Bad),
            "task" | "tasks" => Ok(Category::Task),
            other => Err(RetroError::MalformedMessage(format!(
                "unknown category {other:?}"
            ))),
        }
    }
}

/// Categories a note can live in (tasks are kept separately)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteCategory {
    Good,
    Neutral,
    Bad,
}

impl NoteCategory {
    pub const ALL: [NoteCategory; 3] = [NoteCategory::Good, NoteCategory::Neutral, NoteCategory::Bad];

    pub fn as_str(self) -> &'static str {
        Category::from(self).as_str()
    }
}

impl From<NoteCategory> for Category {
    fn from(category: NoteCategory) -> Self {
        match category {
            NoteCategory::Good => Category::Good,
            NoteCategory::Neutral => Category::Neutral,
            NoteCategory::Bad => Category::Bad,
        }
    }
}

impl TryFrom<Category> for NoteCategory {
    type Error = Category;

    fn try_from(category: Category) -> Result<Self, Self::Error> {
        category.note_category().ok_or(category)
    }
}

/// Display language replicated from the moderator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    De,
    En,
    Pt,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::De, Language::En, Language::Pt];

    pub fn code(self) -> &'static str {
        match self {
            Language::De => "de",
            Language::En => "en",
            Language::Pt => "pt",
        }
    }
}

impl FromStr for Language {
    type Err = RetroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "de" => Ok(Language::De),
            "en" => Ok(Language::En),
            "pt" => Ok(Language::Pt),
            other => Err(RetroError::MalformedMessage(format!(
                "unknown language {other:?}"
            ))),
        }
    }
}

/// Longest accepted category label, in characters
pub const MAX_LABEL_LEN: usize = 100;

/// Display label for each category column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLabelSet {
    pub good: String,
    pub neutral: String,
    pub bad: String,
    #[serde(alias = "tasks")]
    pub task: String,
}

impl CategoryLabelSet {
    /// Default labels for a language
    pub fn for_language(language: Language) -> Self {
        let (good, neutral, bad, task) = match language {
            Language::De => ("Gut", "Neutral", "Schlecht", "Aktionen"),
            Language::En => ("Good", "Neutral", "Bad", "Actions"),
            Language::Pt => ("Bom", "Neutro", "Mau", "Ações"),
        };
        CategoryLabelSet {
            good: good.to_string(),
            neutral: neutral.to_string(),
            bad: bad.to_string(),
            task: task.to_string(),
        }
    }

    /// Whether every label fits within [`MAX_LABEL_LEN`]
    pub fn is_bounded(&self) -> bool {
        [&self.good, &self.neutral, &self.bad, &self.task]
            .iter()
            .all(|label| label.chars().count() <= MAX_LABEL_LEN)
    }

    pub fn get(&self, category: Category) -> &str {
        match category {
            Category::Good => &self.good,
            Category::Neutral => &self.neutral,
            Category::Bad => &self.bad,
            Category::Task => &self.task,
        }
    }

    /// Replace one label, returning whether anything changed. Labels
    /// longer than [`MAX_LABEL_LEN`] characters are refused.
    pub fn set(&mut self, category: Category, label: impl Into<String>) -> bool {
        let label = label.into();
        if label.chars().count() > MAX_LABEL_LEN {
            return false;
        }
        let slot = match category {
            Category::Good => &mut self.good,
            Category::Neutral => &mut self.neutral,
            Category::Bad => &mut self.bad,
            Category::Task => &mut self.task,
        };
        if *slot == label {
            return false;
        }
        *slot = label;
        true
    }
}

impl Default for CategoryLabelSet {
    fn default() -> Self {
        CategoryLabelSet::for_language(Language::default())
    }
}

/// A submitted note, owned by the moderator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: NoteId,
    pub content: String,
    pub category: NoteCategory,
    pub author: String,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_rotation: Option<f32>,
}

impl Note {
    pub fn new(
        id: NoteId,
        content: impl Into<String>,
        category: NoteCategory,
        author: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Note {
            id,
            content: content.into(),
            category,
            author: author.into(),
            created_at,
            visual_color: None,
            visual_rotation: None,
        }
    }
}

/// An action item, moderator-only mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    pub completed: bool,
    pub created_at: Timestamp,
}

impl Task {
    pub fn new(id: TaskId, text: impl Into<String>, created_at: Timestamp) -> Self {
        Task {
            id,
            text: text.into(),
            completed: false,
            created_at,
        }
    }
}

/// A contributor as seen by the moderator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub is_ready: bool,
    pub last_seen: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_accepts_plural_task() {
        let c: Category = serde_json::from_str("\"tasks\"").unwrap();
        assert_eq!(c, Category::Task);
        assert_eq!(serde_json::to_string(&Category::Task).unwrap(), "\"task\"");
        assert_eq!("Tasks".parse::<Category>().unwrap(), Category::Task);
    }

    #[test]
    fn test_note_category_conversion() {
        assert_eq!(NoteCategory::try_from(Category::Bad), Ok(NoteCategory::Bad));
        assert_eq!(NoteCategory::try_from(Category::Task), Err(Category::Task));
        assert_eq!(Category::from(NoteCategory::Good), Category::Good);
    }

    #[test]
    fn test_default_labels_per_language() {
        assert_eq!(CategoryLabelSet::default().bad, "Schlecht");
        assert_eq!(CategoryLabelSet::for_language(Language::En).task, "Actions");
        assert_eq!(CategoryLabelSet::for_language(Language::Pt).good, "Bom");
    }

    #[test]
    fn test_label_set_reports_changes() {
        let mut labels = CategoryLabelSet::for_language(Language::En);
        assert!(labels.set(Category::Good, "Great"));
        assert!(!labels.set(Category::Good, "Great"));
        assert_eq!(labels.get(Category::Good), "Great");
    }

    #[test]
    fn test_label_set_refuses_oversized_labels() {
        let mut labels = CategoryLabelSet::for_language(Language::En);
        let longest = "ä".repeat(MAX_LABEL_LEN);
        assert!(labels.set(Category::Bad, longest.as_str()));
        assert!(!labels.set(Category::Bad, "x".repeat(MAX_LABEL_LEN + 1)));
        assert_eq!(labels.bad, longest);
        assert!(labels.is_bounded());

        labels.task = "y".repeat(MAX_LABEL_LEN + 1);
        assert!(!labels.is_bounded());
    }

    #[test]
    fn test_label_set_wire_shape() {
        let json = r#"{"good":"A","neutral":"B","bad":"C","tasks":"D"}"#;
        let labels: CategoryLabelSet = serde_json::from_str(json).unwrap();
        assert_eq!(labels.task, "D");
    }

    #[test]
    fn test_note_snapshot_field_names() {
        let note = Note::new(
            NoteId::new(3),
            "Good retro",
            NoteCategory::Good,
            "Hans",
            Timestamp::from_millis(42),
        );
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(value["createdAt"], 42);
        assert!(value.get("visualColor").is_none());
    }
}
