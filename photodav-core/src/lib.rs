mod client;
mod multistatus;

pub use client::{ErrorClass, HeadInfo, WebdavClient, WebdavError};
pub use multistatus::RemoteEntry;
