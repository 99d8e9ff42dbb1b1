//! Turns social-media share links into direct video downloads.
//!
//! The pipeline is: resolve the share redirect to a canonical URL, ask
//! yt-dlp which file it would produce, run the real download, then stream
//! the file back while a guard deletes the per-request job directory once
//! the response body is done. The standalone binary mounts
//! [`server::router`]; single-route function hosts can mount
//! [`server::fallback_router`] instead.

pub mod config;
pub mod error;
pub mod resolver;
pub mod server;
pub mod ytdlp;

pub use config::Config;
pub use error::{ApiError, DownloadError};
pub use resolver::ShareLinkResolver;
pub use server::{AppState, fallback_router, router};
pub use ytdlp::Downloader;
