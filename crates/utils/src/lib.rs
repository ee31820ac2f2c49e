pub mod error;

pub use error::{FileIOError, NonUtf8PathError};

use uuid::Uuid;

/// Returns a fresh document identifier: 32 lowercase hex characters.
pub fn new_doc_id() -> String {
	Uuid::new_v4().simple().to_string()
}

/// Combines an iterator of `T` and an iterator of `Option<T>`,
/// removing any `None` values in the process
pub fn chain_optional_iter<T>(
	required: impl IntoIterator<Item = T>,
	optional: impl IntoIterator<Item = Option<T>>,
) -> Vec<T> {
	required
		.into_iter()
		.map(Some)
		.chain(optional)
		.flatten()
		.collect()
}
