use crate::artifact::Artifact;

/// Linear undo/redo timeline of the artifacts produced in one session.
///
/// `cursor` is `None` exactly when `items` is empty. Growth only happens
/// through [`HistoryEngine::append`] and [`HistoryEngine::replace`];
/// navigation never changes the number of items. Appending while the cursor
/// sits before the last item discards the redo tail, there is no branching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryEngine {
    items: Vec<Artifact>,
    cursor: Option<usize>,
}

impl HistoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new lineage: `items = [artifact]`, cursor at 0.
    pub fn replace(&mut self, artifact: Artifact) -> &Artifact {
        self.items.clear();
        self.items.push(artifact);
        self.cursor = Some(0);
        &self.items[0]
    }

    /// Drops everything after the cursor, pushes `artifact` and moves the
    /// cursor onto it.
    pub fn append(&mut self, artifact: Artifact) -> &Artifact {
        let keep = self.cursor.map(|cursor| cursor + 1).unwrap_or(0);
        self.items.truncate(keep);
        self.items.push(artifact);
        let last = self.items.len() - 1;
        self.cursor = Some(last);
        &self.items[last]
    }

    pub fn undo(&mut self) -> Option<&Artifact> {
        if let Some(cursor) = self.cursor.filter(|cursor| *cursor > 0) {
            self.cursor = Some(cursor - 1);
        }
        self.current()
    }

    pub fn redo(&mut self) -> Option<&Artifact> {
        if let Some(cursor) = self.cursor.filter(|cursor| cursor + 1 < self.items.len()) {
            self.cursor = Some(cursor + 1);
        }
        self.current()
    }

    /// Direct time-travel from the timeline; out-of-range indices are ignored.
    pub fn jump_to(&mut self, index: usize) -> Option<&Artifact> {
        if index < self.items.len() {
            self.cursor = Some(index);
        }
        self.current()
    }

    pub fn current(&self) -> Option<&Artifact> {
        self.cursor.and_then(|cursor| self.items.get(cursor))
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn can_undo(&self) -> bool {
        self.cursor.map(|cursor| cursor > 0).unwrap_or(false)
    }

    pub fn can_redo(&self) -> bool {
        self.cursor
            .map(|cursor| cursor + 1 < self.items.len())
            .unwrap_or(false)
    }

    pub fn items(&self) -> &[Artifact] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::HistoryEngine;
    use crate::artifact::Artifact;

    fn item(label: &str) -> Artifact {
        Artifact::image(format!("data:image/png;base64,{label}"), None, label)
    }

    fn labels(history: &HistoryEngine) -> Vec<String> {
        history
            .items()
            .iter()
            .map(|artifact| artifact.action_label.clone())
            .collect()
    }

    fn history_of(labels: &[&str]) -> HistoryEngine {
        let mut history = HistoryEngine::new();
        for label in labels {
            history.append(item(label));
        }
        history
    }

    #[test]
    fn empty_history_has_no_cursor() {
        let mut history = HistoryEngine::new();
        assert_eq!(history.cursor(), None);
        assert!(history.current().is_none());
        assert!(history.undo().is_none());
        assert!(history.redo().is_none());
        assert!(history.jump_to(0).is_none());
        assert_eq!(history.cursor(), None);
    }

    #[test]
    fn append_discards_redo_tail() {
        let mut history = history_of(&["A", "B", "C"]);
        history.jump_to(1);

        history.append(item("D"));
        assert_eq!(labels(&history), vec!["A", "B", "D"]);
        assert_eq!(history.cursor(), Some(2));
        assert!(!history.can_redo());
    }

    #[test]
    fn undo_and_redo_are_clamped() {
        let mut history = history_of(&["A"]);
        history.undo();
        assert_eq!(history.cursor(), Some(0));
        history.redo();
        assert_eq!(history.cursor(), Some(0));

        history.append(item("B"));
        assert_eq!(history.undo().map(|a| a.action_label.as_str()), Some("A"));
        assert_eq!(history.undo().map(|a| a.action_label.as_str()), Some("A"));
        assert_eq!(history.redo().map(|a| a.action_label.as_str()), Some("B"));
        assert_eq!(history.redo().map(|a| a.action_label.as_str()), Some("B"));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn replace_resets_lineage() {
        let mut history = history_of(&["A", "B", "C", "D"]);
        history.undo();

        history.replace(item("X"));
        assert_eq!(labels(&history), vec!["X"]);
        assert_eq!(history.cursor(), Some(0));
        assert!(!history.can_undo());
    }

    #[test]
    fn jump_ignores_out_of_range_indices() {
        let mut history = history_of(&["A", "B", "C"]);
        history.jump_to(0);
        assert_eq!(history.cursor(), Some(0));

        history.jump_to(3);
        assert_eq!(history.cursor(), Some(0));
        history.jump_to(usize::MAX);
        assert_eq!(history.cursor(), Some(0));

        history.jump_to(2);
        assert_eq!(history.cursor(), Some(2));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn clear_returns_to_empty() {
        let mut history = history_of(&["A", "B"]);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.cursor(), None);
    }
}
