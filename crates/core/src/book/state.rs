use std::fmt;

use crate::outline::Outline;

/// Everything one run has produced so far. Owned by a single [`BookEngine`](super::BookEngine).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationState {
    title: Option<String>,
    outline: Option<Outline>,
    completed_paragraph_count: usize,
    content: Option<Vec<Vec<String>>>,
    is_partial: bool,
}

impl GenerationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembles a state from finished parts, e.g. to re-render a stored book.
    pub fn from_parts(
        title: Option<String>,
        outline: Outline,
        content: Vec<Vec<String>>,
        is_partial: bool,
    ) -> Self {
        Self {
            title,
            outline: Some(outline),
            completed_paragraph_count: content.iter().map(Vec::len).sum(),
            content: Some(content),
            is_partial,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn outline(&self) -> Option<&Outline> {
        self.outline.as_ref()
    }

    pub fn completed_paragraph_count(&self) -> usize {
        self.completed_paragraph_count
    }

    pub fn content(&self) -> Option<&[Vec<String>]> {
        self.content.as_deref()
    }

    pub fn is_partial(&self) -> bool {
        self.is_partial
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed: self.completed_paragraph_count,
            total: self.outline.as_ref().map(Outline::total_paragraphs),
        }
    }

    pub(crate) fn set_title(&mut self, title: String) {
        self.title = Some(title);
    }

    pub(crate) fn set_outline(&mut self, outline: Outline) -> &Outline {
        self.outline.insert(outline)
    }

    pub(crate) fn begin_content(&mut self) {
        self.content = Some(Vec::new());
        self.completed_paragraph_count = 0;
        self.is_partial = false;
    }

    pub(crate) fn push_chapter(&mut self, paragraphs: Vec<String>) {
        self.content.get_or_insert_with(Vec::new).push(paragraphs);
    }

    pub(crate) fn paragraph_completed(&mut self) {
        self.completed_paragraph_count += 1;
    }

    pub(crate) fn mark_partial(&mut self) {
        self.is_partial = true;
    }
}

/// Paragraph-level progress. `total` is unknown until an outline exists.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: Option<usize>,
}

impl Progress {
    pub fn ratio(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.completed as f64 / total as f64),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if total > 0 && self.completed >= total)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{}/{}", self.completed, total),
            None => write!(f, "{}/?", self.completed),
        }
    }
}
