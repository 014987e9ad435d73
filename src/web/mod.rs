pub mod downloads;
pub mod responses;
pub mod router;
pub mod state;
pub mod uploads;

pub use downloads::attachment;
pub use responses::{ApiError, internal_error, json_error};
pub use state::AppState;
pub use uploads::{FileFieldConfig, collect_upload_form};
