use crate::domain::position::{decode_table, encode_table, PositionRecord};
use crate::error::PositionError;
use crate::ports::storage::KeyValueStore;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Which local tier a table lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Persistent,
    Session,
}

/// Durable key -> position table spread over up to two local media.
///
/// Both tiers hold the same namespaced table. On load the session tier
/// overrides the persistent one per id.
pub struct PositionStore {
    namespace: String,
    persistent: Option<Box<dyn KeyValueStore>>,
    session: Option<Box<dyn KeyValueStore>>,
}

impl PositionStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            persistent: None,
            session: None,
        }
    }

    pub fn with_persistent(mut self, medium: impl KeyValueStore + 'static) -> Self {
        self.persistent = Some(Box::new(medium));
        self
    }

    pub fn with_session(mut self, medium: impl KeyValueStore + 'static) -> Self {
        self.session = Some(Box::new(medium));
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn tiers(&self) -> impl Iterator<Item = (Tier, &dyn KeyValueStore)> + '_ {
        self.persistent
            .as_deref()
            .map(|medium| (Tier::Persistent, medium))
            .into_iter()
            .chain(self.session.as_deref().map(|medium| (Tier::Session, medium)))
    }

    fn load_tier(&self, tier: Tier, medium: &dyn KeyValueStore) -> HashMap<String, PositionRecord> {
        let raw = match medium.get(&self.namespace) {
            Ok(Some(raw)) => raw,
            Ok(None) => return HashMap::new(),
            Err(e) => {
                warn!(?tier, error = %e, "Position storage unavailable, starting empty");
                return HashMap::new();
            }
        };
        match decode_table(&raw) {
            Ok(table) => {
                debug!(?tier, count = table.len(), "Loaded positions");
                table
            }
            Err(e) => {
                warn!(?tier, error = %e, "Failed to parse stored positions, starting empty");
                HashMap::new()
            }
        }
    }

    /// Read every tier; session-scoped values win over persistent ones.
    pub fn load(&self) -> HashMap<String, PositionRecord> {
        let mut table = HashMap::new();
        for (tier, medium) in self.tiers() {
            table.extend(self.load_tier(tier, medium));
        }
        table
    }

    /// Write the full table to every tier.
    ///
    /// All tiers are attempted; the first failure is returned.
    pub fn write<'a, I>(&self, records: I) -> Result<(), PositionError>
    where
        I: IntoIterator<Item = &'a PositionRecord>,
    {
        let encoded = encode_table(records)?;
        let mut first_error = None;
        for (tier, medium) in self.tiers() {
            if let Err(e) = medium.set(&self.namespace, &encoded) {
                warn!(?tier, error = %e, "Failed to write positions");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove the table from every tier.
    pub fn clear(&self) {
        for (tier, medium) in self.tiers() {
            if let Err(e) = medium.remove(&self.namespace) {
                warn!(?tier, error = %e, "Failed to clear positions");
            }
        }
    }
}
