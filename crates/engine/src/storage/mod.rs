pub mod filesystem;
pub mod traits;

pub use filesystem::FileSystemBlobCache;
pub use traits::{BlobCache, BlobWriter, CacheBlob, DynBlobCache};
