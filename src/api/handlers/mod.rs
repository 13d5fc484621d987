mod admin;
mod files;

pub use admin::{health, requeue_transfer, transfer_status};
pub use files::{download_file, download_url, fast_upload, get_blob, upload_file};
