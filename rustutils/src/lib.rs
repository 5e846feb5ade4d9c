// Misc utilities useful to archivelog, jobsumm and summarize.

mod configs;
mod dates;

// Summarizer configuration, and reading it from a file.

pub use configs::parse_summarize_config;
pub use configs::read_summarize_config;
pub use configs::SummarizeConfig;
pub use configs::DEFAULT_DATASOURCE;
pub use configs::DEFAULT_GOOD_ENOUGH_FRACTION;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// The time right now.

pub use dates::now;

// Parse a &str into a Timestamp.

pub use dates::parse_timestamp;

// Seconds since the epoch, as a float.

pub use dates::timestamp_to_secs;

// Archive time, seconds and microseconds.

pub use dates::Timeval;
