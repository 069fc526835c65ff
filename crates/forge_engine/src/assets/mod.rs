//! Asset access
//!
//! The asset packaging tool and its file format live outside the engine; the
//! contract consumed here is a keyed blob store with `open` and `stat`.

mod vpak;

pub use vpak::{
    read_varint, DirectoryPack, ImageFilter, ImageFormat, ImageWrapMode, Pack, PackEntry,
    PackError, PackStream, TextureHeader,
};
