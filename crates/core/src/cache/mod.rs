mod error;
mod keys;
mod patterns;
mod serialization;

pub use error::{CacheError, Result};
pub use keys::{
    all_details_pattern, dashboard_key, dashboard_pattern, detail_key, detail_pattern,
    is_detail_key, is_list_key, list_key, list_pattern, namespace_pattern, QueryKey,
    DASHBOARD_NAMESPACE,
};
pub use patterns::{pattern_matches, KeyPattern};
pub use serialization::{
    from_payload, list_from_payload, to_payload, SerializationError,
};
