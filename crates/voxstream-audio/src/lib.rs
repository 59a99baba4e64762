pub mod source;

pub use source::PcmSource;
