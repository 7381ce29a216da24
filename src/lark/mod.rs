//! Lark / Feishu Open Platform client.

pub mod bitable;
pub mod client;
pub mod drive;
pub mod im;
pub mod token;

pub use bitable::{BitableClient, Page, Record, Snapshot, TableInfo, TableRecords};
pub use client::{Download, LarkClient, RetryPolicy};
pub use drive::{DriveClient, FileBody, MediaUpload, UploadForm, UploadTarget, LARK_MAX_FILE_UPLOAD_BYTES};
pub use im::{CardSender, ImClient};
pub use token::{TenantTokenIssuer, TokenCache, TokenIssuer};
