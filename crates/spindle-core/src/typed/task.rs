//! Task trait - binds a payload type to its task type name.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed task payload.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RefreshMovie {
///     movie_ids: Vec<u64>,
/// }
///
/// impl Task for RefreshMovie {
///     const TYPE: &'static str = "movies.refresh.v1";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name under which the handler is registered.
    const TYPE: &'static str;
}
