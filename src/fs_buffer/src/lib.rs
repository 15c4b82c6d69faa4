mod file_cache;
mod file_data;

pub use file_cache::FileCache;
pub use file_data::{FileData, FileHandle};
