//! Archiving - chained signing of versions and statuses into object
//! storage
//!
//! - **signer**: key set, signature format, verification
//! - **records**: canonical blob forms and the object key layout
//! - **object_store**: the S3 gateway and its in-memory test double
//! - **worker**: the archiver loop

pub mod object_store;
pub mod records;
pub mod signer;
pub mod worker;

pub use self::object_store::{MemoryStore, ObjectStore, ObjectStoreError, S3Store};
pub use self::records::{status_key, version_key, StatusArchive, VersionArchive};
pub use self::signer::{SignerError, SigningKey, SigningKeySet, SigningKeySpec};
pub use self::worker::{load_or_bootstrap_keys, Archiver};
