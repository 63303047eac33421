pub mod cancel;
pub mod config;
pub mod database;
pub mod manager;
pub mod streams;

pub use cancel::{CancelSet, CancelToken};
pub use config::TransferConfig;
pub use database::VolumeDatabase;
pub use manager::{
    BackendFactory, IndexVolumeWriter, TransferEvent, TransferManager, VolumeUpload,
};
pub use skiff_types::error::{Result, SkiffError};
pub use skiff_types::remote_volume::{FileEntry, QuotaInfo, RemoteVolume, VolumeState};

#[cfg(test)]
mod testutil;
