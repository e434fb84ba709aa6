use std::collections::HashMap;

/// Run-scoped record of the customer ids already emitted, with the email seen first.
///
/// Append-only: entries are never replaced or evicted for the lifetime of a run.
#[derive(Debug, Default)]
pub struct DedupRegister {
    first_seen: HashMap<i64, String>,
}

impl DedupRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self, customer_id: i64) -> bool {
        self.first_seen.contains_key(&customer_id)
    }

    /// First write wins; later records for the same id are ignored.
    pub fn record(&mut self, customer_id: i64, email: impl Into<String>) {
        self.first_seen.entry(customer_id).or_insert_with(|| email.into());
    }

    pub fn email_for(&self, customer_id: i64) -> Option<&str> {
        self.first_seen.get(&customer_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}
