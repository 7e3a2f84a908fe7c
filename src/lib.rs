#![forbid(unsafe_code)]

// coderoom library - realtime collaboration room server

pub mod metrics;
pub mod room;
pub mod signaling;
