use crate::error::PositionError;

/// String-keyed storage medium backing the local position tiers.
///
/// Local media are synchronous so the final flush on teardown can complete
/// before the process or player goes away.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, PositionError>;

    /// Overwrite the value stored under `key`
    fn set(&self, key: &str, value: &str) -> Result<(), PositionError>;

    /// Remove `key`; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), PositionError>;
}
