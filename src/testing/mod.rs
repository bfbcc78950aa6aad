//! Test doubles and helpers shared by the unit tests

pub mod codecs;
pub mod mp4;
pub mod sources;
