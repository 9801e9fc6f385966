#![no_std]
#[cfg(feature = "std")]
extern crate std;

pub mod backend;
pub mod card;
pub mod flash;
#[cfg(feature = "std")]
pub mod image;

pub use backend::{sector_addr, StorageBackend};
pub use card::CardBackend;
pub use flash::FlashBackend;
#[cfg(feature = "std")]
pub use image::ImageFlash;
