pub mod error;
pub mod remote_volume;
pub mod volume_name;
