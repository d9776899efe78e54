#![cfg_attr(not(test), no_std)]

pub mod block;
pub mod card;
pub mod fat;
pub mod fs;
pub mod path;

pub use block::{BlockDevice, BLOCK_SIZE};
pub use card::{CardState, CardType, SdCard, SdCardConfig, SdCardError, SdSpi};
pub use fat::{FatError, FileHandle, FileKind, OpenMode, Volume};
pub use fs::SdFs;
pub use path::{next_component, walk_path, PathPolicy};
