use jobmon_core::JobListing;

/// Hook applied to normalized listings before reconciliation.
pub trait ListingFilter: Send + Sync {
    fn keep(&self, listing: &JobListing) -> bool;

    /// Split `listings` into the kept ones and the number dropped.
    fn apply(&self, listings: Vec<JobListing>) -> (Vec<JobListing>, usize) {
        let before = listings.len();
        let kept: Vec<_> = listings.into_iter().filter(|l| self.keep(l)).collect();
        let dropped = before - kept.len();
        (kept, dropped)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughFilter;

impl ListingFilter for PassThroughFilter {
    fn keep(&self, _listing: &JobListing) -> bool {
        true
    }
}

/// Case-insensitive keyword rules over title and snippet.
#[derive(Debug, Default, Clone)]
pub struct KeywordFilter {
    required: Vec<String>,
    excluded: Vec<String>,
}

impl KeywordFilter {
    pub fn new(required: &[String], excluded: &[String]) -> Self {
        let clean = |words: &[String]| {
            words
                .iter()
                .map(|w| w.trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect::<Vec<_>>()
        };
        Self {
            required: clean(required),
            excluded: clean(excluded),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.excluded.is_empty()
    }
}

impl ListingFilter for KeywordFilter {
    fn keep(&self, listing: &JobListing) -> bool {
        let haystack = format!("{} {}", listing.title, listing.description_snippet).to_lowercase();
        if self.excluded.iter().any(|w| haystack.contains(w.as_str())) {
            return false;
        }
        self.required.is_empty() || self.required.iter().any(|w| haystack.contains(w.as_str()))
    }
}
