// Format detection for served files.

pub mod content_type;
