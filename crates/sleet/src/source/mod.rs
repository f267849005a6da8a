//! Source-side stages: file enumeration and raw IO.

pub mod enumerate;
pub mod reader;

pub use enumerate::DatasetSource;
