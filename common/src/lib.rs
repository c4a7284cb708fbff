// Copyright 2023 Oxide Computer Company
use serde::{Deserialize, Serialize};

pub mod props;
pub use props::PropList;

#[derive(thiserror::Error, Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum PoolError {
    #[error("Error: {0}")]
    GenericError(String),

    #[error("IO Error: {0}")]
    IoError(String),

    #[error("device is in use")]
    DeviceBusy,

    #[error("packed config does not fit in the label phys region")]
    NameTooLong,

    #[error("invalid config: {0}")]
    InvalidArgument(String),

    #[error("no valid device available")]
    NoDevice,
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::IoError(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for PoolError {
    fn from(e: anyhow::Error) -> Self {
        PoolError::GenericError(format!("{:?}", e))
    }
}

#[macro_export]
macro_rules! pool_bail {
    ($i:ident) => { return Err(PoolError::$i) };
    ($i:ident, $str:expr) => { return Err(PoolError::$i($str.to_string())) };
    ($i:ident, $fmt:expr, $($arg:tt)*) => { return Err(PoolError::$i(format!($fmt, $($arg)*))) };
}
