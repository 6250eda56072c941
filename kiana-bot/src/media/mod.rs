mod downloader;

pub use downloader::{MediaDownloader, clean_dir};
