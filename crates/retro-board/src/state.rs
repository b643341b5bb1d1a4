//! Moderator session state
//!
//! `SessionState` is the single source of truth for a hosted session. It is
//! mutated only by the moderator endpoint: remote submissions and presence
//! arrive through `submit` and the roster, everything else is a local
//! action of the moderator.

use serde::{Deserialize, Serialize};

use retro_core::{
    Category, CategoryLabelSet, Language, Note, NoteCategory, NoteId, RetroError, RetroResult,
    Task, TaskId, Timestamp,
};

use crate::Roster;

/// Where a submission ended up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    Note(NoteId),
    Task(TaskId),
}

/// Persisted part of the session state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BoardSnapshot {
    pub notes: Vec<Note>,
    pub tasks: Vec<Task>,
    #[serde(alias = "isRevealed")]
    pub revealed: bool,
    #[serde(alias = "categoryLabels")]
    pub labels: CategoryLabelSet,
    pub language: Language,
}

/// Authoritative state of one hosted session
#[derive(Clone, Debug)]
pub struct SessionState {
    notes: Vec<Note>,
    tasks: Vec<Task>,
    roster: Roster,
    labels: CategoryLabelSet,
    language: Language,
    revealed: bool,
    next_note_id: u64,
    next_task_id: u64,
    /// Bumped on every change to notes, tasks, labels, language or reveal
    revision: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new(Language::default())
    }
}

impl SessionState {
    pub fn new(language: Language) -> Self {
        SessionState {
            notes: Vec::new(),
            tasks: Vec::new(),
            roster: Roster::new(),
            labels: CategoryLabelSet::for_language(language),
            language,
            revealed: false,
            next_note_id: 1,
            next_task_id: 1,
            revision: 0,
        }
    }

    /// Rebuild state from a snapshot. Id counters continue past the
    /// highest restored id.
    pub fn from_snapshot(snapshot: BoardSnapshot) -> Self {
        let next_note_id = successor(snapshot.notes.iter().map(|n| n.id.0));
        let next_task_id = successor(snapshot.tasks.iter().map(|t| t.id.0));
        let labels = if snapshot.labels.is_bounded() {
            snapshot.labels
        } else {
            tracing::warn!("restored labels exceed the length limit, using defaults");
            CategoryLabelSet::for_language(snapshot.language)
        };
        let mut state = SessionState {
            notes: snapshot.notes,
            tasks: snapshot.tasks,
            roster: Roster::new(),
            labels,
            language: snapshot.language,
            revealed: snapshot.revealed,
            next_note_id,
            next_task_id,
            revision: 0,
        };
        if state.next_note_id == u64::MAX {
            state.renumber_notes();
        }
        if state.next_task_id == u64::MAX {
            state.renumber_tasks();
        }
        state
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            notes: self.notes.clone(),
            tasks: self.tasks.clone(),
            revealed: self.revealed,
            labels: self.labels.clone(),
            language: self.language,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn note(&self, id: NoteId) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    pub fn labels(&self) -> &CategoryLabelSet {
        &self.labels
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    // ------------------------------------------------------------------
    // Remote write path
    // ------------------------------------------------------------------

    /// Accept a submission. Tasks go to the task list, everything else is
    /// appended to the notes with a fresh id and the given server time.
    pub fn submit(
        &mut self,
        content: &str,
        category: Category,
        author: &str,
        now: Timestamp,
    ) -> RetroResult<Submitted> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RetroError::EmptyContent);
        }

        match category.note_category() {
            Some(note_category) => {
                let id = self.allocate_note_id();
                self.notes
                    .push(Note::new(id, content, note_category, author, now));
                self.touch();
                Ok(Submitted::Note(id))
            }
            None => Ok(Submitted::Task(self.push_task(content, now))),
        }
    }

    // ------------------------------------------------------------------
    // Local moderator actions
    // ------------------------------------------------------------------

    /// Move one note to another column
    pub fn move_note(&mut self, id: NoteId, to: NoteCategory) -> bool {
        self.move_notes(&[id], to) > 0
    }

    /// Move several notes (usually all members of a group); returns how
    /// many actually changed column
    pub fn move_notes(&mut self, ids: &[NoteId], to: NoteCategory) -> usize {
        let mut moved = 0;
        for note in self.notes.iter_mut().filter(|n| ids.contains(&n.id)) {
            if note.category != to {
                note.category = to;
                moved += 1;
            }
        }
        if moved > 0 {
            self.touch();
        }
        moved
    }

    /// Replace the content of one note
    pub fn edit_note(&mut self, id: NoteId, content: &str) -> RetroResult<bool> {
        Ok(self.edit_notes(&[id], content)? > 0)
    }

    /// Replace the content of several notes
    pub fn edit_notes(&mut self, ids: &[NoteId], content: &str) -> RetroResult<usize> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RetroError::EmptyContent);
        }

        let mut edited = 0;
        for note in self.notes.iter_mut().filter(|n| ids.contains(&n.id)) {
            if note.content != content {
                note.content = content.to_string();
                edited += 1;
            }
        }
        if edited > 0 {
            self.touch();
        }
        Ok(edited)
    }

    pub fn add_task(&mut self, text: &str, now: Timestamp) -> RetroResult<TaskId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RetroError::EmptyContent);
        }
        Ok(self.push_task(text, now))
    }

    fn allocate_note_id(&mut self) -> NoteId {
        if self.next_note_id == u64::MAX {
            self.renumber_notes();
        }
        let id = NoteId::new(self.next_note_id);
        self.next_note_id += 1;
        id
    }

    fn allocate_task_id(&mut self) -> TaskId {
        if self.next_task_id == u64::MAX {
            self.renumber_tasks();
        }
        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    /// Reassign note ids 1..=n in list order once the id space is used up
    fn renumber_notes(&mut self) {
        tracing::warn!(notes = self.notes.len(), "note ids exhausted, renumbering");
        for (n, note) in (1..).zip(self.notes.iter_mut()) {
            note.id = NoteId::new(n);
        }
        self.next_note_id = self.notes.len() as u64 + 1;
    }

    fn renumber_tasks(&mut self) {
        tracing::warn!(tasks = self.tasks.len(), "task ids exhausted, renumbering");
        for (n, task) in (1..).zip(self.tasks.iter_mut()) {
            task.id = TaskId::new(n);
        }
        self.next_task_id = self.tasks.len() as u64 + 1;
    }

    fn push_task(&mut self, text: &str, now: Timestamp) -> TaskId {
        let id = self.allocate_task_id();
        self.tasks.push(Task::new(id, text, now));
        self.touch();
        id
    }

    /// Flip completion, returning the new value
    pub fn toggle_task(&mut self, id: TaskId) -> Option<bool> {
        let task = self.tasks.iter_mut().find(|t| t.id == id)?;
        task.completed = !task.completed;
        let completed = task.completed;
        self.touch();
        Some(completed)
    }

    pub fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.id == id)?;
        let task = self.tasks.remove(pos);
        self.touch();
        Some(task)
    }

    pub fn update_label(&mut self, category: Category, label: &str) -> bool {
        let changed = self.labels.set(category, label);
        if changed {
            self.touch();
        }
        changed
    }

    /// Switch language. Labels are reset to the new language's defaults.
    pub fn set_language(&mut self, language: Language) {
        self.language = language;
        self.labels = CategoryLabelSet::for_language(language);
        self.touch();
    }

    /// Flip the reveal flag, returning the new value
    pub fn toggle_reveal(&mut self) -> bool {
        self.revealed = !self.revealed;
        self.touch();
        self.revealed
    }

    pub fn set_revealed(&mut self, revealed: bool) {
        if self.revealed != revealed {
            self.revealed = revealed;
            self.touch();
        }
    }

    /// Clear notes, tasks and reveal. Labels, language and roster survive.
    pub fn reset(&mut self) {
        self.notes.clear();
        self.tasks.clear();
        self.revealed = false;
        self.touch();
    }
}

/// Id after the highest of `ids`, pinned at `u64::MAX` when none is left
fn successor(ids: impl Iterator<Item = u64>) -> u64 {
    ids.max().unwrap_or(0).saturating_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use retro_core::MAX_LABEL_LEN;

    fn t(secs: i64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn test_submit_assigns_unique_ids() {
        let mut state = SessionState::default();
        let a = state.submit("Good retro", Category::Good, "Hans", t(1)).unwrap();
        let b = state.submit("good retro", Category::Good, "Lena", t(2)).unwrap();

        assert_ne!(a, b);
        assert_eq!(state.notes().len(), 2);
        assert_eq!(state.notes()[1].created_at, t(2));
    }

    #[test]
    fn test_submit_task_routes_to_task_list() {
        let mut state = SessionState::default();
        let res = state.submit("  Fix CI  ", Category::Task, "Hans", t(1)).unwrap();

        let Submitted::Task(id) = res else {
            panic!("expected task, got {res:?}");
        };
        assert!(state.notes().is_empty());
        let task = state.task(id).unwrap();
        assert_eq!(task.text, "Fix CI");
        assert!(!task.completed);
    }

    #[test]
    fn test_submit_rejects_blank() {
        let mut state = SessionState::default();
        assert_eq!(
            state.submit("   ", Category::Bad, "Hans", t(1)),
            Err(RetroError::EmptyContent)
        );
        assert_eq!(state.revision(), 0);
    }

    #[test]
    fn test_move_and_edit_group() {
        let mut state = SessionState::default();
        let Submitted::Note(a) = state.submit("x", Category::Good, "A", t(1)).unwrap() else {
            unreachable!()
        };
        let Submitted::Note(b) = state.submit("X", Category::Good, "B", t(2)).unwrap() else {
            unreachable!()
        };

        assert_eq!(state.move_notes(&[a, b], NoteCategory::Bad), 2);
        assert_eq!(state.move_notes(&[a, b], NoteCategory::Bad), 0);
        assert!(state.notes().iter().all(|n| n.category == NoteCategory::Bad));

        assert_eq!(state.edit_notes(&[a, b], " y ").unwrap(), 2);
        assert_eq!(state.note(a).unwrap().content, "y");
        assert!(state.edit_note(a, "").is_err());
    }

    #[test]
    fn test_task_lifecycle() {
        let mut state = SessionState::default();
        let id = state.add_task("Write docs", t(1)).unwrap();
        assert_eq!(state.toggle_task(id), Some(true));
        assert_eq!(state.toggle_task(id), Some(false));
        assert!(state.remove_task(id).is_some());
        assert_eq!(state.toggle_task(id), None);
        assert!(state.add_task("  ", t(2)).is_err());
    }

    #[test]
    fn test_language_resets_labels() {
        let mut state = SessionState::default();
        state.update_label(Category::Good, "Super");
        state.set_language(Language::En);
        assert_eq!(state.labels().good, "Good");
        assert_eq!(state.language(), Language::En);
    }

    #[test]
    fn test_reset_keeps_labels() {
        let mut state = SessionState::new(Language::En);
        state.update_label(Category::Good, "Great");
        state.submit("a", Category::Good, "A", t(1)).unwrap();
        state.add_task("b", t(1)).unwrap();
        state.toggle_reveal();

        state.reset();
        assert!(state.notes().is_empty());
        assert!(state.tasks().is_empty());
        assert!(!state.is_revealed());
        assert_eq!(state.labels().good, "Great");
    }

    #[test]
    fn test_snapshot_restores_counters() {
        let mut state = SessionState::default();
        state.submit("a", Category::Good, "A", t(1)).unwrap();
        state.submit("b", Category::Bad, "B", t(1)).unwrap();
        state.toggle_reveal();

        let json = serde_json::to_string(&state.snapshot()).unwrap();
        let restored: BoardSnapshot = serde_json::from_str(&json).unwrap();
        let mut state = SessionState::from_snapshot(restored);

        assert!(state.is_revealed());
        let Submitted::Note(id) = state.submit("c", Category::Neutral, "C", t(2)).unwrap() else {
            unreachable!()
        };
        assert_eq!(id, NoteId::new(3));
    }

    #[test]
    fn test_snapshot_with_exhausted_ids_is_renumbered() {
        let json = format!(
            r#"{{"notes":[
                {{"id":7,"content":"a","category":"good","author":"A","createdAt":1}},
                {{"id":{max},"content":"b","category":"bad","author":"B","createdAt":2}}
            ],"tasks":[{{"id":{max},"text":"t","completed":false,"createdAt":3}}]}}"#,
            max = u64::MAX
        );
        let snapshot: BoardSnapshot = serde_json::from_str(&json).unwrap();
        let mut state = SessionState::from_snapshot(snapshot);

        let ids: Vec<NoteId> = state.notes().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![NoteId::new(1), NoteId::new(2)]);
        assert_eq!(state.tasks()[0].id, TaskId::new(1));

        let Submitted::Note(id) = state.submit("c", Category::Neutral, "C", t(4)).unwrap() else {
            unreachable!()
        };
        assert_eq!(id, NoteId::new(3));
        assert_eq!(state.add_task("u", t(5)).unwrap(), TaskId::new(2));
    }

    #[test]
    fn test_id_below_max_keeps_counting_without_overflow() {
        let json = format!(
            r#"{{"notes":[{{"id":{},"content":"a","category":"good","author":"A","createdAt":1}}]}}"#,
            u64::MAX - 1
        );
        let mut state = SessionState::from_snapshot(serde_json::from_str(&json).unwrap());

        let Submitted::Note(first) = state.submit("b", Category::Good, "B", t(2)).unwrap() else {
            unreachable!()
        };
        let Submitted::Note(second) = state.submit("c", Category::Good, "C", t(3)).unwrap() else {
            unreachable!()
        };
        assert_ne!(first, second);
        let mut ids: Vec<NoteId> = state.notes().iter().map(|n| n.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_snapshot_tolerates_missing_fields() {
        let snapshot: BoardSnapshot = serde_json::from_str(r#"{"isRevealed":true}"#).unwrap();
        assert!(snapshot.revealed);
        assert!(snapshot.notes.is_empty());
        assert_eq!(snapshot.language, Language::De);
    }

    #[test]
    fn test_oversized_labels_are_refused() {
        let mut state = SessionState::new(Language::En);
        let revision = state.revision();
        assert!(!state.update_label(Category::Good, &"x".repeat(MAX_LABEL_LEN + 1)));
        assert_eq!(state.labels().good, "Good");
        assert_eq!(state.revision(), revision);

        let mut snapshot = state.snapshot();
        snapshot.labels.neutral = "y".repeat(MAX_LABEL_LEN * 4);
        let restored = SessionState::from_snapshot(snapshot);
        assert_eq!(restored.labels(), &CategoryLabelSet::for_language(Language::En));
    }
}
