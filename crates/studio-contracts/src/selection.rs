/// A transient "pick one of N" buffer.
///
/// Candidates only exist while the selection is awaiting a choice; choosing
/// or dismissing empties the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSelection<T> {
    Absent,
    AwaitingChoice(Vec<T>),
    Resolved { index: usize },
}

impl<T> Default for PendingSelection<T> {
    fn default() -> Self {
        PendingSelection::Absent
    }
}

impl<T> PendingSelection<T> {
    /// Presents candidates for selection. An empty list leaves nothing to pick.
    pub fn offer(&mut self, candidates: Vec<T>) {
        *self = if candidates.is_empty() {
            PendingSelection::Absent
        } else {
            PendingSelection::AwaitingChoice(candidates)
        };
    }

    /// Takes the candidate at `index`, dropping the rest.
    ///
    /// Returns `None` (and keeps the buffer) when nothing is awaiting a choice
    /// or the index is out of range.
    pub fn choose(&mut self, index: usize) -> Option<T> {
        let PendingSelection::AwaitingChoice(candidates) = self else {
            return None;
        };
        if index >= candidates.len() {
            return None;
        }
        let chosen = candidates.swap_remove(index);
        *self = PendingSelection::Resolved { index };
        Some(chosen)
    }

    pub fn dismiss(&mut self) {
        *self = PendingSelection::Absent;
    }

    pub fn candidates(&self) -> &[T] {
        match self {
            PendingSelection::AwaitingChoice(candidates) => candidates,
            _ => &[],
        }
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self, PendingSelection::AwaitingChoice(_))
    }
}
