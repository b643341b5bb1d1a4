//! Idea Aggregation Engine
//!
//! Turns the flat, append-only note list into display groups:
//! - notes are partitioned by category (tasks never appear here)
//! - within a category, notes sharing a grouping key form one group
//! - groups keep first-seen order, merged authors and constituent ids
//!
//! Group styles (palette color and tilt) are derived from a per-session
//! seed and the group's first-seen ordinal, then cached by key so a group
//! keeps its look across recomputations.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use retro_core::{Note, NoteCategory, NoteId, Timestamp};

/// Sticky note palette, cycled by first-seen order
pub const NOTE_PALETTE: [&str; 5] = ["#FFECB3", "#CFD8DC", "#FFCCBC", "#C8E6C9", "#F8BBD0"];

/// Maximum tilt in degrees, either direction
pub const MAX_ROTATION: f32 = 2.0;

/// Normalize content into its grouping key.
///
/// Only surrounding whitespace and letter case are folded; inner
/// whitespace is significant.
pub fn grouping_key(content: &str) -> String {
    content.trim().to_lowercase()
}

/// Visual style of a group
#[derive(Clone, Debug, PartialEq)]
pub struct GroupStyle {
    pub color: String,
    pub rotation: f32,
}

/// A display group of notes sharing one grouping key
#[derive(Clone, Debug, PartialEq)]
pub struct IdeaGroup {
    /// Id of the note that seeded the group
    pub id: NoteId,
    pub key: String,
    pub category: NoteCategory,
    /// Representative content (the first note's)
    pub content: String,
    /// Distinct authors in first-seen order
    pub authors: Vec<String>,
    /// Number of submissions, including duplicates by the same author
    pub count: usize,
    pub note_ids: Vec<NoteId>,
    pub style: GroupStyle,
    pub first_created_at: Timestamp,
}

impl IdeaGroup {
    /// Content as the board should show it. Hidden until revealed.
    pub fn visible_content(&self, revealed: bool) -> Option<&str> {
        revealed.then_some(self.content.as_str())
    }

    fn merge(&mut self, note: &Note) {
        if !self.authors.iter().any(|a| a == &note.author) {
            self.authors.push(note.author.clone());
        }
        self.note_ids.push(note.id);
        self.count += 1;
    }
}

/// Grouped notes per column
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Board {
    pub good: Vec<IdeaGroup>,
    pub neutral: Vec<IdeaGroup>,
    pub bad: Vec<IdeaGroup>,
}

impl Board {
    pub fn groups(&self, category: NoteCategory) -> &[IdeaGroup] {
        match category {
            NoteCategory::Good => &self.good,
            NoteCategory::Neutral => &self.neutral,
            NoteCategory::Bad => &self.bad,
        }
    }

    fn groups_mut(&mut self, category: NoteCategory) -> &mut Vec<IdeaGroup> {
        match category {
            NoteCategory::Good => &mut self.good,
            NoteCategory::Neutral => &mut self.neutral,
            NoteCategory::Bad => &mut self.bad,
        }
    }

    /// Find the group containing a note
    pub fn group_of(&self, note: NoteId) -> Option<&IdeaGroup> {
        NoteCategory::ALL
            .iter()
            .flat_map(|c| self.groups(*c))
            .find(|g| g.note_ids.contains(&note))
    }

    pub fn group_count(&self) -> usize {
        self.good.len() + self.neutral.len() + self.bad.len()
    }

    pub fn total_notes(&self) -> usize {
        NoteCategory::ALL
            .iter()
            .flat_map(|c| self.groups(*c))
            .map(|g| g.count)
            .sum()
    }
}

fn category_salt(category: NoteCategory) -> u64 {
    match category {
        NoteCategory::Good => 0x676f_6f64,
        NoteCategory::Neutral => 0x6e65_7574,
        NoteCategory::Bad => 0x0062_6164,
    }
}

/// Aggregation engine with a per-session style cache
#[derive(Clone, Debug)]
pub struct IdeaAggregator {
    seed: u64,
    styles: HashMap<(NoteCategory, String), GroupStyle>,
    /// Distinct keys ever styled, per category
    ordinals: HashMap<NoteCategory, usize>,
}

impl Default for IdeaAggregator {
    fn default() -> Self {
        IdeaAggregator::with_random_seed()
    }
}

impl IdeaAggregator {
    pub fn new(seed: u64) -> Self {
        IdeaAggregator {
            seed,
            styles: HashMap::new(),
            ordinals: HashMap::new(),
        }
    }

    pub fn with_random_seed() -> Self {
        IdeaAggregator::new(rand::thread_rng().gen())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Forget cached styles; the next aggregation restyles from scratch
    pub fn clear(&mut self) {
        self.styles.clear();
        self.ordinals.clear();
    }

    /// Group the notes for display
    pub fn aggregate(&mut self, notes: &[Note]) -> Board {
        let mut board = Board::default();
        let mut index: HashMap<(NoteCategory, String), usize> = HashMap::new();

        for note in notes {
            let key = grouping_key(&note.content);
            let slot = (note.category, key);

            if let Some(&pos) = index.get(&slot) {
                board.groups_mut(note.category)[pos].merge(note);
                continue;
            }

            let style = self.style_for(note, &slot.1);
            let groups = board.groups_mut(note.category);
            groups.push(IdeaGroup {
                id: note.id,
                key: slot.1.clone(),
                category: note.category,
                content: note.content.clone(),
                authors: vec![note.author.clone()],
                count: 1,
                note_ids: vec![note.id],
                style,
                first_created_at: note.created_at,
            });
            index.insert(slot, groups.len() - 1);
        }

        board
    }

    fn style_for(&mut self, note: &Note, key: &str) -> GroupStyle {
        let cache_key = (note.category, key.to_string());
        if let Some(style) = self.styles.get(&cache_key) {
            return style.clone();
        }

        let ordinal = self.ordinals.entry(note.category).or_insert(0);
        let n = *ordinal;
        *ordinal += 1;

        let color = note
            .visual_color
            .clone()
            .unwrap_or_else(|| NOTE_PALETTE[n % NOTE_PALETTE.len()].to_string());
        let rotation = note.visual_rotation.unwrap_or_else(|| {
            let mut rng = StdRng::seed_from_u64(
                self.seed ^ category_salt(note.category) ^ (n as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            );
            rng.gen_range(-MAX_ROTATION..MAX_ROTATION)
        });

        let style = GroupStyle { color, rotation };
        self.styles.insert(cache_key, style.clone());
        style
    }
}

/// One-shot aggregation with a fixed seed
pub fn aggregate(notes: &[Note], seed: u64) -> Board {
    IdeaAggregator::new(seed).aggregate(notes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: u64, content: &str, category: NoteCategory, author: &str) -> Note {
        Note::new(
            NoteId::new(id),
            content,
            category,
            author,
            Timestamp::from_millis(id as i64),
        )
    }

    #[test]
    fn test_case_and_whitespace_collapse() {
        let notes = vec![
            note(1, "Good retro", NoteCategory::Good, "Hans"),
            note(2, "  good RETRO ", NoteCategory::Good, "Lena"),
        ];
        let board = aggregate(&notes, 7);

        assert_eq!(board.good.len(), 1);
        let group = &board.good[0];
        assert_eq!(group.content, "Good retro");
        assert_eq!(group.authors, vec!["Hans", "Lena"]);
        assert_eq!(group.count, 2);
        assert_eq!(group.note_ids, vec![NoteId::new(1), NoteId::new(2)]);
        assert_eq!(group.id, NoteId::new(1));
    }

    #[test]
    fn test_inner_whitespace_is_significant() {
        let notes = vec![
            note(1, "good retro", NoteCategory::Good, "A"),
            note(2, "good  retro", NoteCategory::Good, "B"),
        ];
        assert_eq!(aggregate(&notes, 0).good.len(), 2);
    }

    #[test]
    fn test_categories_never_merge() {
        let notes = vec![
            note(1, "Coffee", NoteCategory::Good, "A"),
            note(2, "coffee", NoteCategory::Bad, "B"),
        ];
        let board = aggregate(&notes, 0);
        assert_eq!(board.good.len(), 1);
        assert_eq!(board.bad.len(), 1);
        assert!(board.neutral.is_empty());
    }

    #[test]
    fn test_same_author_counted_not_duplicated() {
        let notes = vec![
            note(1, "x", NoteCategory::Neutral, "Hans"),
            note(2, "X", NoteCategory::Neutral, "Hans"),
            note(3, "x", NoteCategory::Neutral, "hans"),
        ];
        let board = aggregate(&notes, 0);
        let group = &board.neutral[0];
        assert_eq!(group.count, 3);
        assert_eq!(group.authors, vec!["Hans", "hans"]);
    }

    #[test]
    fn test_palette_cycles_by_first_seen() {
        let notes: Vec<Note> = (0..6)
            .map(|i| note(i, &format!("idea {i}"), NoteCategory::Good, "A"))
            .collect();
        let board = aggregate(&notes, 0);
        let colors: Vec<&str> = board.good.iter().map(|g| g.style.color.as_str()).collect();
        assert_eq!(colors[0], NOTE_PALETTE[0]);
        assert_eq!(colors[4], NOTE_PALETTE[4]);
        assert_eq!(colors[5], NOTE_PALETTE[0]);
    }

    #[test]
    fn test_style_is_retained() {
        let mut engine = IdeaAggregator::new(42);
        let mut notes = vec![note(1, "a", NoteCategory::Good, "A")];
        let first = engine.aggregate(&notes).good[0].clone();

        notes.insert(0, note(2, "b", NoteCategory::Good, "B"));
        notes.push(note(3, "A", NoteCategory::Good, "C"));
        let board = engine.aggregate(&notes);

        let again = board.good.iter().find(|g| g.key == "a").unwrap();
        assert_eq!(again.style, first.style);
        assert!(first.style.rotation >= -MAX_ROTATION && first.style.rotation < MAX_ROTATION);
    }

    #[test]
    fn test_seed_determines_rotation() {
        let notes = vec![note(1, "a", NoteCategory::Bad, "A")];
        assert_eq!(aggregate(&notes, 9).bad[0].style, aggregate(&notes, 9).bad[0].style);
    }

    #[test]
    fn test_note_visuals_take_precedence() {
        let mut n = note(1, "a", NoteCategory::Good, "A");
        n.visual_color = Some("#000000".to_string());
        n.visual_rotation = Some(1.5);
        let board = aggregate(&[n], 0);
        assert_eq!(board.good[0].style.color, "#000000");
        assert_eq!(board.good[0].style.rotation, 1.5);
    }

    #[test]
    fn test_visible_content() {
        let board = aggregate(&[note(1, "secret", NoteCategory::Bad, "A")], 0);
        assert_eq!(board.bad[0].visible_content(false), None);
        assert_eq!(board.bad[0].visible_content(true), Some("secret"));
        assert_eq!(board.group_of(NoteId::new(1)).map(|g| g.id), Some(NoteId::new(1)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn category() -> impl Strategy<Value = NoteCategory> {
            prop_oneof![
                Just(NoteCategory::Good),
                Just(NoteCategory::Neutral),
                Just(NoteCategory::Bad),
            ]
        }

        proptest! {
            #[test]
            fn counts_cover_every_note(
                entries in proptest::collection::vec(("[a-cA-C ]{1,4}", category(), "[a-c]"), 0..40)
            ) {
                let notes: Vec<Note> = entries
                    .iter()
                    .enumerate()
                    .map(|(i, (c, cat, a))| note(i as u64, c, *cat, a))
                    .collect();
                let board = aggregate(&notes, 1);

                prop_assert_eq!(board.total_notes(), notes.len());
                for cat in NoteCategory::ALL {
                    let mut keys = std::collections::HashSet::new();
                    for group in board.groups(cat) {
                        prop_assert!(keys.insert(group.key.clone()));
                        prop_assert_eq!(group.count, group.note_ids.len());
                        let mut authors = group.authors.clone();
                        authors.sort();
                        authors.dedup();
                        prop_assert_eq!(authors.len(), group.authors.len());
                    }
                }
            }

            #[test]
            fn padding_and_case_do_not_split(
                content in "[a-z]{1,8}",
                left in " {0,3}",
                right in " {0,3}",
            ) {
                let notes = vec![
                    note(1, &content, NoteCategory::Good, "A"),
                    note(2, &format!("{left}{}{right}", content.to_uppercase()), NoteCategory::Good, "B"),
                ];
                let board = aggregate(&notes, 3);
                prop_assert_eq!(board.good.len(), 1);
                prop_assert_eq!(board.good[0].count, 2);
            }
        }
    }
}
