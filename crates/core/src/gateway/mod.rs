mod error;
mod http_mapping;
mod traits;
mod types;

pub use error::{DateRangeError, GatewayError, RejectionReason, Result};
pub use http_mapping::gateway_error_from_status;
pub use traits::{ChangeFeed, FullGateway, Gateway};
pub use types::{
    ChangeEvent, ChangeKind, Condition, DateRange, Filter, FilterOp, OrderBy, Row, SelectQuery,
    Table,
};
