use crate::state::RunMode;

/// Per-mode pagination position, persisted independently of any run
///
/// `last_page_index` is the last page whose items were durably upserted;
/// zero means nothing has been processed yet, so the next page is 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub mode: RunMode,
    pub last_page_index: u32,
    pub last_seen_item_id: Option<String>,
}

impl Cursor {
    /// A cursor positioned before the first page
    pub fn start(mode: RunMode) -> Self {
        Self {
            mode,
            last_page_index: 0,
            last_seen_item_id: None,
        }
    }

    /// The page a resumed walk should fetch next
    pub fn next_page(&self) -> u32 {
        self.last_page_index.saturating_add(1)
    }

    /// Returns the cursor moved past `page`, remembering the last item seen on it
    pub fn advanced_to(&self, page: u32, last_item: Option<String>) -> Self {
        Self {
            mode: self.mode,
            last_page_index: page,
            last_seen_item_id: last_item.or_else(|| self.last_seen_item_id.clone()),
        }
    }
}
