//! Change events posted by a database

/// Where a committed change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Replicated,
}

/// One committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseChange {
    /// Changed documents, sorted and unique
    pub doc_ids: Vec<String>,
    pub source: ChangeSource,
}

impl DatabaseChange {
    pub fn contains(&self, doc_id: &str) -> bool {
        self.doc_ids.binary_search_by(|id| id.as_str().cmp(doc_id)).is_ok()
    }
}

/// A committed change to one watched document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub doc_id: String,
    pub source: ChangeSource,
}
